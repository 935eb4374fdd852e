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

//! Thin in-place AEAD wrapper over ring.

use ring::aead;

use crate::crypto::algs::Cipher;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// One-direction AEAD key.
pub struct AeadKey {
    key: aead::LessSafeKey,
}

/// Opaque failure; callers map it to the appropriate protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeadError;

impl AeadKey {
    /// `key` length must match `cipher.key_length()`.
    pub fn new(cipher: Cipher, key: &[u8]) -> Result<AeadKey, AeadError> {
        let alg = match cipher {
            Cipher::Aes128Gcm => &aead::AES_128_GCM,
            Cipher::Aes256Gcm => &aead::AES_256_GCM,
            Cipher::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
            _ => return Err(AeadError),
        };
        let key = aead::UnboundKey::new(alg, key).map_err(|_| AeadError)?;
        Ok(AeadKey {
            key: aead::LessSafeKey::new(key),
        })
    }

    /// Encrypt `in_out` in place, returning the tag to append.
    pub fn seal(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
    ) -> Result<[u8; TAG_LEN], AeadError> {
        let nonce = aead::Nonce::assume_unique_for_key(nonce);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, aead::Aad::from(aad), in_out)
            .map_err(|_| AeadError)?;
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypt `in_out` (ciphertext followed by tag) in place; the plaintext
    /// occupies the first `in_out.len() - TAG_LEN` bytes afterwards.
    pub fn open(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        in_out: &mut [u8],
    ) -> Result<usize, AeadError> {
        let nonce = aead::Nonce::assume_unique_for_key(nonce);
        let plain = self
            .key
            .open_in_place(nonce, aead::Aad::from(aad), in_out)
            .map_err(|_| AeadError)?;
        Ok(plain.len())
    }
}
