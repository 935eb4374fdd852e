// Copyright 2019 Guanhao Yin <sopium@mysterious.site>

// This file is part of TiOVPN.

// TiOVPN is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// TiOVPN is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with TiOVPN.  If not, see <https://www.gnu.org/licenses/>.

//! Compression framing stubs. Only the one-byte hint framing is handled
//! here; actual compression algorithms are external and never invoked by
//! the engine, so every packet goes out with the "uncompressed" marker.

use crate::buffer::Buffer;
use crate::openvpn::error::Error;

/// Hint byte marking an uncompressed payload.
pub const NO_COMPRESS: u8 = 0xFA;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressMethod {
    /// No compression framing at all.
    #[default]
    None,
    /// `comp-lzo` style framing, stub mode.
    LzoStub,
    /// `compress` style framing, stub mode.
    Stub,
}

/// Compression context negotiated for a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressContext {
    pub method: CompressMethod,
}

impl CompressContext {
    pub fn new(method: CompressMethod) -> CompressContext {
        CompressContext { method }
    }

    pub fn enabled(&self) -> bool {
        self.method != CompressMethod::None
    }

    /// Fragment for the options consistency string.
    pub fn options_string(&self) -> Option<&'static str> {
        match self.method {
            CompressMethod::None => None,
            CompressMethod::LzoStub => Some("comp-lzo"),
            CompressMethod::Stub => Some("compress"),
        }
    }

    /// Fragment for the client peer-info blob.
    pub fn peer_info_string(&self) -> Option<&'static str> {
        match self.method {
            CompressMethod::None => None,
            CompressMethod::LzoStub => Some("IV_LZO_STUB=1\n"),
            CompressMethod::Stub => Some("IV_COMP_STUB=1\n"),
        }
    }

    /// Bytes the framing adds to each data packet.
    pub fn extra_payload_bytes(&self) -> usize {
        if self.enabled() {
            1
        } else {
            0
        }
    }

    pub fn compress(&self, buf: &mut Buffer) {
        if self.enabled() {
            buf.push_front(NO_COMPRESS);
        }
    }

    pub fn decompress(&self, buf: &mut Buffer) -> Result<(), Error> {
        if !self.enabled() {
            return Ok(());
        }
        match buf.read_u8() {
            Ok(NO_COMPRESS) => Ok(()),
            _ => Err(Error::Compress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_roundtrip() {
        let c = CompressContext::new(CompressMethod::LzoStub);
        let mut buf = Buffer::from_slice(b"data");
        c.compress(&mut buf);
        assert_eq!(buf.len(), 5);
        c.decompress(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), b"data");
    }

    #[test]
    fn none_is_transparent() {
        let c = CompressContext::default();
        let mut buf = Buffer::from_slice(b"data");
        c.compress(&mut buf);
        c.decompress(&mut buf).unwrap();
        assert_eq!(buf.as_slice(), b"data");
    }

    #[test]
    fn unknown_hint_is_an_error() {
        let c = CompressContext::new(CompressMethod::Stub);
        let mut buf = Buffer::from_slice(&[0x66, 1, 2]);
        assert_eq!(c.decompress(&mut buf), Err(Error::Compress));
    }
}
