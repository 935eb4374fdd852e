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

//! Pre-shared static key material and the control channel HMAC wrap
//! ("tls-auth"), which authenticates peers before any TLS state is built.

use rand::rngs::OsRng;
use rand::RngCore;
use ring::constant_time::verify_slices_are_equal;
use ring::hmac;

use crate::crypto::Digest;
use crate::openvpn::error::OptionError;
use crate::openvpn::packet::{key_id_extract, opcode_extract};
use crate::openvpn::packet_id::PacketId;
use crate::openvpn::psid::Psid;

/// Offset of the HMAC field in a wrapped control packet:
/// `[op(1)][psid(8)][hmac][packet id(8)][...]`. The HMAC covers everything
/// except its own field.
pub const HMAC_OFFSET: usize = 1 + Psid::SIZE;

const PEM_BEGIN: &str = "-----BEGIN OpenVPN Static key V1-----";
const PEM_END: &str = "-----END OpenVPN Static key V1-----";

const SLOT_SIZE: usize = 64;

/// Slice selector bits for [`OpenVPNStaticKey::slice`].
pub const CIPHER: u8 = 0;
pub const HMAC: u8 = 1 << 0;
pub const ENCRYPT: u8 = 0;
pub const DECRYPT: u8 = 1 << 1;
pub const NORMAL: u8 = 0;
/// Swaps the encrypt/decrypt slots; one side of a connection uses NORMAL
/// and the other INVERSE so their key material lines up.
pub const INVERSE: u8 = 1 << 2;

/// 256 bytes of pre-shared key material, viewed as four 64-byte slots:
/// cipher/encrypt, HMAC/encrypt, cipher/decrypt, HMAC/decrypt.
#[derive(Clone)]
pub struct OpenVPNStaticKey {
    data: [u8; OpenVPNStaticKey::SIZE],
}

impl OpenVPNStaticKey {
    pub const SIZE: usize = 4 * SLOT_SIZE;

    pub fn random() -> OpenVPNStaticKey {
        let mut data = [0u8; OpenVPNStaticKey::SIZE];
        OsRng.fill_bytes(&mut data);
        OpenVPNStaticKey { data }
    }

    pub fn from_bytes(data: [u8; OpenVPNStaticKey::SIZE]) -> OpenVPNStaticKey {
        OpenVPNStaticKey { data }
    }

    /// Select a 64-byte slot by `CIPHER`/`HMAC`, `ENCRYPT`/`DECRYPT` and
    /// `NORMAL`/`INVERSE` flags.
    pub fn slice(&self, flags: u8) -> &[u8] {
        let mut idx = flags & (HMAC | DECRYPT);
        if flags & INVERSE != 0 {
            idx ^= DECRYPT;
        }
        let off = usize::from(idx) * SLOT_SIZE;
        &self.data[off..off + SLOT_SIZE]
    }

    /// Parse the `-----BEGIN OpenVPN Static key V1-----` file format.
    /// Lines outside the markers (comments) are ignored.
    pub fn parse(text: &str) -> Result<OpenVPNStaticKey, OptionError> {
        let mut in_key = false;
        let mut hex_data = String::with_capacity(2 * OpenVPNStaticKey::SIZE);
        for line in text.lines() {
            let line = line.trim();
            if line == PEM_BEGIN {
                in_key = true;
            } else if line == PEM_END {
                break;
            } else if in_key {
                hex_data.push_str(line);
            }
        }
        let bytes = hex::decode(&hex_data).map_err(|_| OptionError::BadStaticKey)?;
        let data: [u8; OpenVPNStaticKey::SIZE] =
            bytes.try_into().map_err(|_| OptionError::BadStaticKey)?;
        Ok(OpenVPNStaticKey { data })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(PEM_BEGIN);
        out.push('\n');
        for chunk in self.data.chunks(16) {
            out.push_str(&hex::encode(chunk));
            out.push('\n');
        }
        out.push_str(PEM_END);
        out.push('\n');
        out
    }

    pub fn wipe(&mut self) {
        self.data = [0u8; OpenVPNStaticKey::SIZE];
    }
}

/// Direction of the static key slots, the `key-direction` option. Each side
/// of a connection must use the opposite value, or both use `Bidirectional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Bidirectional,
    Zero,
    One,
}

impl KeyDirection {
    pub fn parse(s: &str) -> Result<KeyDirection, OptionError> {
        match s {
            "0" => Ok(KeyDirection::Zero),
            "1" => Ok(KeyDirection::One),
            "bidirectional" | "bi" => Ok(KeyDirection::Bidirectional),
            _ => Err(OptionError::BadKeyDirection),
        }
    }
}

fn hmac_algorithm(digest: Digest) -> Result<hmac::Algorithm, OptionError> {
    match digest {
        Digest::Sha1 => Ok(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
        Digest::Sha256 => Ok(hmac::HMAC_SHA256),
        Digest::Sha512 => Ok(hmac::HMAC_SHA512),
        _ => Err(OptionError::UnknownDigest(digest.name().into())),
    }
}

fn compute(key: &hmac::Key, data: &[u8], hmac_off: usize, hmac_len: usize) -> hmac::Tag {
    let mut ctx = hmac::Context::with_key(key);
    ctx.update(&data[..hmac_off]);
    ctx.update(&data[hmac_off + hmac_len..]);
    ctx.sign()
}

/// Send/receive HMAC pair for the control channel wrap.
pub struct TlsAuth {
    send: hmac::Key,
    recv: hmac::Key,
    size: usize,
}

impl TlsAuth {
    pub fn new(
        key: &OpenVPNStaticKey,
        dir: KeyDirection,
        digest: Digest,
    ) -> Result<TlsAuth, OptionError> {
        let alg = hmac_algorithm(digest)?;
        let n = digest.size();
        let (send_slice, recv_slice) = match dir {
            KeyDirection::Bidirectional => (key.slice(HMAC), key.slice(HMAC)),
            KeyDirection::Zero => (
                key.slice(HMAC | ENCRYPT | NORMAL),
                key.slice(HMAC | DECRYPT | NORMAL),
            ),
            KeyDirection::One => (
                key.slice(HMAC | ENCRYPT | INVERSE),
                key.slice(HMAC | DECRYPT | INVERSE),
            ),
        };
        Ok(TlsAuth {
            send: hmac::Key::new(alg, &send_slice[..n]),
            recv: hmac::Key::new(alg, &recv_slice[..n]),
            size: n,
        })
    }

    /// HMAC output size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fill the HMAC hole of an outgoing packet. The packet must already be
    /// fully framed around the `self.size()`-byte hole at [`HMAC_OFFSET`].
    pub fn sign(&self, data: &mut [u8]) {
        let tag = compute(&self.send, data, HMAC_OFFSET, self.size);
        data[HMAC_OFFSET..HMAC_OFFSET + self.size].copy_from_slice(tag.as_ref());
    }

    /// Verify the HMAC of an incoming packet (constant-time compare).
    pub fn check(&self, data: &[u8]) -> bool {
        if data.len() < HMAC_OFFSET + self.size + PacketId::LONG_SIZE {
            return false;
        }
        let tag = compute(&self.recv, data, HMAC_OFFSET, self.size);
        verify_slices_are_equal(tag.as_ref(), &data[HMAC_OFFSET..HMAC_OFFSET + self.size]).is_ok()
    }
}

/// Standalone validator for the initial hard reset, checking only the
/// tls-auth HMAC. A server frontend can run this before allocating any
/// session state for an unknown peer.
pub struct TlsAuthPreValidate {
    recv: hmac::Key,
    size: usize,
    reset_op: u8,
}

impl TlsAuthPreValidate {
    pub fn new(
        key: &OpenVPNStaticKey,
        dir: KeyDirection,
        digest: Digest,
        server: bool,
    ) -> Result<TlsAuthPreValidate, OptionError> {
        let alg = hmac_algorithm(digest)?;
        let n = digest.size();
        let recv_slice = match dir {
            KeyDirection::Bidirectional => key.slice(HMAC),
            KeyDirection::Zero => key.slice(HMAC | DECRYPT | NORMAL),
            KeyDirection::One => key.slice(HMAC | DECRYPT | INVERSE),
        };
        let reset_op = if server {
            crate::openvpn::packet::CONTROL_HARD_RESET_CLIENT_V2
        } else {
            crate::openvpn::packet::CONTROL_HARD_RESET_SERVER_V2
        };
        Ok(TlsAuthPreValidate {
            recv: hmac::Key::new(alg, &recv_slice[..n]),
            size: n,
            reset_op,
        })
    }

    pub fn validate(&self, buf: &[u8]) -> bool {
        let op = match buf.first() {
            Some(&op) => op,
            None => return false,
        };
        if opcode_extract(op) != self.reset_op || key_id_extract(op) != 0 {
            return false;
        }
        if buf.len() < HMAC_OFFSET + self.size + PacketId::LONG_SIZE {
            return false;
        }
        let tag = compute(&self.recv, buf, HMAC_OFFSET, self.size);
        verify_slices_are_equal(tag.as_ref(), &buf[HMAC_OFFSET..HMAC_OFFSET + self.size]).is_ok()
    }
}
