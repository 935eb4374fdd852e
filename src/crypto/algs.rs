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

//! Registry of data channel ciphers and digests, looked up by the names used
//! in option strings. Knowing a cipher here does not imply this build can
//! instantiate it; legacy CBC modes are recognized for negotiation and MTU
//! arithmetic only.

/// Data channel cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    None,
    BfCbc,
    Des3Cbc,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Cipher {
    pub fn lookup(name: &str) -> Option<Cipher> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Some(Cipher::None),
            "BF-CBC" => Some(Cipher::BfCbc),
            "DES-EDE3-CBC" => Some(Cipher::Des3Cbc),
            "AES-128-CBC" => Some(Cipher::Aes128Cbc),
            "AES-256-CBC" => Some(Cipher::Aes256Cbc),
            "AES-128-GCM" => Some(Cipher::Aes128Gcm),
            "AES-256-GCM" => Some(Cipher::Aes256Gcm),
            "CHACHA20-POLY1305" => Some(Cipher::ChaCha20Poly1305),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cipher::None => "none",
            Cipher::BfCbc => "BF-CBC",
            Cipher::Des3Cbc => "DES-EDE3-CBC",
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
            Cipher::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Key length in bytes.
    pub fn key_length(self) -> usize {
        match self {
            Cipher::None => 0,
            Cipher::BfCbc => 16,
            Cipher::Des3Cbc => 24,
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm | Cipher::ChaCha20Poly1305 => 32,
        }
    }

    /// Block size in bytes, zero for stream constructions.
    pub fn block_size(self) -> usize {
        match self {
            Cipher::None | Cipher::ChaCha20Poly1305 => 0,
            Cipher::BfCbc | Cipher::Des3Cbc => 8,
            Cipher::Aes128Cbc | Cipher::Aes256Cbc => 16,
            Cipher::Aes128Gcm | Cipher::Aes256Gcm => 16,
        }
    }

    pub fn is_aead(self) -> bool {
        matches!(
            self,
            Cipher::Aes128Gcm | Cipher::Aes256Gcm | Cipher::ChaCha20Poly1305
        )
    }

    /// 64-bit block ciphers are subject to birthday-bound data limits
    /// (CVE-2016-6329).
    pub fn is_bs64(self) -> bool {
        matches!(self, Cipher::BfCbc | Cipher::Des3Cbc)
    }

    /// Worst-case bytes the data channel crypto layer adds to a packet,
    /// excluding the op head and the packet ID. For CBC modes: IV, padding
    /// and the HMAC; for AEAD modes: the tag.
    pub fn encap_overhead(self, digest: Digest) -> usize {
        if self.is_aead() {
            aead_tag_len()
        } else if self == Cipher::None {
            digest.size()
        } else {
            // IV + maximal PKCS#7 padding + HMAC
            self.block_size() * 2 + digest.size()
        }
    }
}

pub const fn aead_tag_len() -> usize {
    16
}

/// Data channel / tls-auth HMAC digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    None,
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl Digest {
    pub fn lookup(name: &str) -> Option<Digest> {
        match name.to_ascii_uppercase().as_str() {
            "NONE" => Some(Digest::None),
            "MD5" => Some(Digest::Md5),
            "SHA1" => Some(Digest::Sha1),
            "SHA256" => Some(Digest::Sha256),
            "SHA512" => Some(Digest::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Digest::None => "none",
            Digest::Md5 => "MD5",
            Digest::Sha1 => "SHA1",
            Digest::Sha256 => "SHA256",
            Digest::Sha512 => "SHA512",
        }
    }

    /// Output size in bytes.
    pub fn size(self) -> usize {
        match self {
            Digest::None => 0,
            Digest::Md5 => 16,
            Digest::Sha1 => 20,
            Digest::Sha256 => 32,
            Digest::Sha512 => 64,
        }
    }
}
