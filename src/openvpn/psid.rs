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

use rand::prelude::*;
use std::fmt;

use crate::buffer::{BufResult, Buffer};

/// Protocol session ID: 8 random bytes identifying one endpoint of one
/// session. Each endpoint picks its own at session start and learns the
/// peer's from the first authenticated control packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Psid([u8; Psid::SIZE]);

impl Psid {
    pub const SIZE: usize = 8;

    /// Generate a fresh random session ID.
    pub fn random() -> Psid {
        let mut id = [0u8; Psid::SIZE];
        thread_rng().fill_bytes(&mut id);
        Psid(id)
    }

    /// # Panics
    ///
    /// Slice must be 8 bytes long.
    pub fn from_slice(s: &[u8]) -> Psid {
        let mut id = [0u8; Psid::SIZE];
        id.copy_from_slice(s);
        Psid(id)
    }

    pub fn read(buf: &mut Buffer) -> BufResult<Psid> {
        Ok(Psid(buf.read_array()?))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn prepend(&self, buf: &mut Buffer) {
        buf.prepend(&self.0);
    }
}

impl fmt::Display for Psid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Psid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
