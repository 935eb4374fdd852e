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

//! Packet buffer with reserved headroom and tailroom, so headers can be
//! prepended and authentication tags appended without reallocating in the
//! hot path.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Out-of-range access on a [`Buffer`]. Maps to `Error::Buffer` at the
/// protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferError;

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("buffer access out of range")
    }
}

impl std::error::Error for BufferError {}

pub type BufResult<T> = Result<T, BufferError>;

/// A byte buffer whose content occupies `data[offset..]`. The region before
/// `offset` is headroom for prepends; `Vec` spare capacity is tailroom.
#[derive(Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    offset: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// An empty buffer with `headroom` bytes reserved for prepends and at
    /// least `capacity` bytes for content and appends.
    pub fn with_layout(capacity: usize, headroom: usize) -> Buffer {
        let mut data = Vec::with_capacity(capacity + headroom);
        data.resize(headroom, 0);
        Buffer {
            data,
            offset: headroom,
        }
    }

    pub fn from_slice(content: &[u8]) -> Buffer {
        Buffer {
            data: content.to_vec(),
            offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..]
    }

    /// Drop the content but keep the current headroom.
    pub fn clear(&mut self) {
        self.data.truncate(self.offset);
    }

    /// Discard `n` bytes from the front.
    pub fn advance(&mut self, n: usize) -> BufResult<()> {
        if n > self.len() {
            return Err(BufferError);
        }
        self.offset += n;
        Ok(())
    }

    pub fn truncate(&mut self, new_len: usize) {
        if new_len < self.len() {
            self.data.truncate(self.offset + new_len);
        }
    }

    pub fn read_u8(&mut self) -> BufResult<u8> {
        let b = *self.as_slice().first().ok_or(BufferError)?;
        self.offset += 1;
        Ok(b)
    }

    pub fn read_u16_be(&mut self) -> BufResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> BufResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Consume `n` bytes and return them as a slice.
    pub fn read_slice(&mut self, n: usize) -> BufResult<&[u8]> {
        if n > self.len() {
            return Err(BufferError);
        }
        let start = self.offset;
        self.offset += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_array<const N: usize>(&mut self) -> BufResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_slice(N)?);
        Ok(out)
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_u8(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn append_u16_be(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }

    pub fn append_u32_be(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }

    pub fn push_front(&mut self, b: u8) {
        self.prepend(&[b]);
    }

    pub fn prepend(&mut self, bytes: &[u8]) {
        let dst = self.prepend_alloc(bytes.len());
        dst.copy_from_slice(bytes);
    }

    pub fn prepend_u32_be(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }

    /// Open an `n`-byte hole at the front and return it for the caller to
    /// fill. Grows headroom if the reserve is exhausted.
    pub fn prepend_alloc(&mut self, n: usize) -> &mut [u8] {
        if self.offset < n {
            let extra = n.max(64);
            let mut data = Vec::with_capacity(self.data.len() + extra);
            data.resize(extra, 0);
            data.extend_from_slice(&self.data[self.offset..]);
            self.data = data;
            self.offset = extra;
        }
        self.offset -= n;
        &mut self.data[self.offset..self.offset + n]
    }

    pub fn peek_u32_be(&self) -> BufResult<u32> {
        if self.len() < 4 {
            return Err(BufferError);
        }
        Ok(BigEndian::read_u32(self.as_slice()))
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        self.data.drain(..self.offset);
        self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer[{}+{}] {}",
            self.offset,
            self.len(),
            hex::encode(self.as_slice())
        )
    }
}

/// Headroom/tailroom presets applied to freshly allocated packet buffers.
/// Sized for the worst-case control channel head (op, session ID, HMAC,
/// packet ID, ACK block) and an AEAD tag at the tail.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub headroom: usize,
    pub tailroom: usize,
}

impl Default for Frame {
    fn default() -> Frame {
        Frame {
            headroom: 128,
            tailroom: 64,
        }
    }
}

impl Frame {
    pub fn prepare(&self) -> Buffer {
        Buffer::with_layout(self.tailroom, self.headroom)
    }

    /// Prepare a buffer that already holds `content`.
    pub fn prepare_with(&self, content: &[u8]) -> Buffer {
        let mut b = Buffer::with_layout(content.len() + self.tailroom, self.headroom);
        b.append(content);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut b = Buffer::with_layout(32, 8);
        b.append_u32_be(0xdead_beef);
        b.append(&[1, 2, 3]);
        b.push_front(0x42);
        assert_eq!(b.len(), 8);
        assert_eq!(b.read_u8().unwrap(), 0x42);
        assert_eq!(b.read_u32_be().unwrap(), 0xdead_beef);
        assert_eq!(b.read_slice(3).unwrap(), &[1, 2, 3]);
        assert!(b.is_empty());
        assert_eq!(b.read_u8(), Err(BufferError));
    }

    #[test]
    fn prepend_grows_headroom() {
        let mut b = Buffer::from_slice(&[9, 9]);
        b.prepend(&[1, 2, 3, 4]);
        assert_eq!(b.as_slice(), &[1, 2, 3, 4, 9, 9]);
        let hole = b.prepend_alloc(2);
        hole.copy_from_slice(&[7, 8]);
        assert_eq!(b.as_slice(), &[7, 8, 1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn advance_and_clear() {
        let mut b = Buffer::from_slice(&[1, 2, 3, 4]);
        b.advance(2).unwrap();
        assert_eq!(b.as_slice(), &[3, 4]);
        assert!(b.advance(3).is_err());
        b.clear();
        assert!(b.is_empty());
        // Headroom from the consumed front is still usable.
        b.push_front(5);
        assert_eq!(b.as_slice(), &[5]);
    }

    #[test]
    fn truncate_drops_tail() {
        let mut b = Buffer::from_slice(&[1, 2, 3, 4]);
        b.truncate(2);
        assert_eq!(b.as_slice(), &[1, 2]);
        b.truncate(10);
        assert_eq!(b.len(), 2);
    }
}
