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

//! Data channel crypto instances and the per-key byte limits for 64-bit
//! block ciphers.
//!
//! AEAD framing: `[head 1|4][packet id 4][ciphertext][tag 16]`. The head is
//! authenticated as AAD, the packet id rides in the nonce together with an
//! implicit IV derived from the HMAC key slots.

use crate::buffer::Buffer;
use crate::crypto::aead::{AeadKey, NONCE_LEN, TAG_LEN};
use crate::crypto::{Cipher, Digest};
use crate::openvpn::error::{Error, OptionError};
use crate::openvpn::packet_id::{PacketId, PacketIdSend, PidMode, ReplayWindow};
use crate::openvpn::tls_auth::{
    OpenVPNStaticKey, CIPHER, DECRYPT, ENCRYPT, HMAC,
};

/// Per-key byte budget for 64-bit block ciphers (CVE-2016-6329).
pub const BS64_DATA_LIMIT: u64 = 48_000_000;

/// Negotiated data channel algorithms.
#[derive(Debug, Clone, Copy)]
pub struct DcSettings {
    pub cipher: Cipher,
    pub digest: Digest,
}

impl DcSettings {
    /// Worst-case bytes the crypto layer adds, excluding the op head.
    pub fn encap_overhead(&self) -> usize {
        PacketId::SHORT_SIZE + self.cipher.encap_overhead(self.digest)
    }
}

/// One keyed data channel instance: encrypt/decrypt with packet ID
/// maintenance and replay protection.
pub trait DcInstance {
    /// Encrypt `buf` in place (payload only; the caller prepends `head`
    /// afterwards). `head` is the 1- or 4-byte op head, authenticated as
    /// AAD. Returns true when the send counter approaches wrap and the key
    /// must be renegotiated.
    fn encrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<bool, Error>;

    /// Decrypt `buf` in place; `head` is the already-stripped op head.
    fn decrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<(), Error>;
}

/// Builds [`DcInstance`]s from derived key material. `dir` is `NORMAL` on
/// the client and `INVERSE` on the server, giving the two sides mirrored
/// slot orientations.
pub trait DcFactory {
    fn new_instance(
        &self,
        settings: &DcSettings,
        key: &OpenVPNStaticKey,
        dir: u8,
        pid_mode: PidMode,
        key_id: u8,
    ) -> Result<Box<dyn DcInstance>, OptionError>;
}

/// Default factory: ring-backed AEAD ciphers plus the null cipher. Legacy
/// CBC constructions are recognized by the registry but cannot be
/// instantiated here.
#[derive(Debug, Default)]
pub struct RingDcFactory;

impl DcFactory for RingDcFactory {
    fn new_instance(
        &self,
        settings: &DcSettings,
        key: &OpenVPNStaticKey,
        dir: u8,
        pid_mode: PidMode,
        _key_id: u8,
    ) -> Result<Box<dyn DcInstance>, OptionError> {
        let cipher = settings.cipher;
        if cipher == Cipher::None {
            return Ok(Box::new(PlainDcInstance));
        }
        if !cipher.is_aead() {
            return Err(OptionError::UnsupportedCipher(cipher.name().into()));
        }
        let n = cipher.key_length();
        let unsupported = |_| OptionError::UnsupportedCipher(cipher.name().into());
        let seal = AeadKey::new(cipher, &key.slice(CIPHER | ENCRYPT | dir)[..n])
            .map_err(unsupported)?;
        let open = AeadKey::new(cipher, &key.slice(CIPHER | DECRYPT | dir)[..n])
            .map_err(unsupported)?;
        let mut iv_send = [0u8; 8];
        let mut iv_recv = [0u8; 8];
        iv_send.copy_from_slice(&key.slice(HMAC | ENCRYPT | dir)[..8]);
        iv_recv.copy_from_slice(&key.slice(HMAC | DECRYPT | dir)[..8]);
        Ok(Box::new(AeadDcInstance {
            seal,
            open,
            iv_send,
            iv_recv,
            pid_send: PacketIdSend::new(false),
            replay: ReplayWindow::new(pid_mode),
        }))
    }
}

struct AeadDcInstance {
    seal: AeadKey,
    open: AeadKey,
    iv_send: [u8; 8],
    iv_recv: [u8; 8],
    pid_send: PacketIdSend,
    replay: ReplayWindow,
}

fn nonce(pid: [u8; 4], iv: &[u8; 8]) -> [u8; NONCE_LEN] {
    let mut n = [0u8; NONCE_LEN];
    n[..4].copy_from_slice(&pid);
    n[4..].copy_from_slice(iv);
    n
}

impl DcInstance for AeadDcInstance {
    fn encrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<bool, Error> {
        let (pid, wrap) = self.pid_send.next(0);
        let pid_bytes = pid.id.to_be_bytes();
        let tag = self
            .seal
            .seal(nonce(pid_bytes, &self.iv_send), head, buf.as_mut_slice())
            .map_err(|_| Error::Decrypt)?;
        buf.append(&tag);
        buf.prepend(&pid_bytes);
        Ok(wrap)
    }

    fn decrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<(), Error> {
        let pid_bytes: [u8; 4] = buf.read_array().map_err(|_| Error::Buffer)?;
        if buf.len() < TAG_LEN {
            return Err(Error::Buffer);
        }
        let n = self
            .open
            .open(nonce(pid_bytes, &self.iv_recv), head, buf.as_mut_slice())
            .map_err(|_| Error::Decrypt)?;
        buf.truncate(n);

        let pid = PacketId {
            id: u32::from_be_bytes(pid_bytes),
            time: 0,
        };
        if !self.replay.test(pid) {
            return Err(Error::Replay);
        }
        self.replay.add(pid);
        Ok(())
    }
}

/// Null cipher: packets pass through unmodified.
struct PlainDcInstance;

impl DcInstance for PlainDcInstance {
    fn encrypt(&mut self, _buf: &mut Buffer, _head: &[u8]) -> Result<bool, Error> {
        Ok(false)
    }

    fn decrypt(&mut self, _buf: &mut Buffer, _head: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlMode {
    Encrypt,
    Decrypt,
}

/// Data flow level of one direction: nothing yet, first packet processed,
/// or limit exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DlState {
    None,
    Green,
    Red,
}

#[derive(Debug, Clone, Copy)]
struct DlDir {
    bytes: u64,
    level: DlState,
}

/// Byte counters driving data-limited rekeying of 64-bit block ciphers.
#[derive(Debug, Clone, Copy)]
pub struct DataLimit {
    limit: u64,
    encrypt: DlDir,
    decrypt: DlDir,
}

impl DataLimit {
    pub fn new(limit: u64) -> DataLimit {
        let dir = DlDir {
            bytes: 0,
            level: DlState::None,
        };
        DataLimit {
            limit,
            encrypt: dir,
            decrypt: dir,
        }
    }

    fn dir_mut(&mut self, mode: DlMode) -> &mut DlDir {
        match mode {
            DlMode::Encrypt => &mut self.encrypt,
            DlMode::Decrypt => &mut self.decrypt,
        }
    }

    /// Count `bytes` in `mode`; returns the newly reached level, or
    /// `DlState::None` when no threshold was crossed by this call.
    pub fn add(&mut self, mode: DlMode, bytes: usize) -> DlState {
        let limit = self.limit;
        let dir = self.dir_mut(mode);
        dir.bytes = dir.bytes.saturating_add(bytes as u64);
        let level = if dir.bytes > limit {
            DlState::Red
        } else {
            DlState::Green
        };
        if level > dir.level {
            dir.level = level;
            level
        } else {
            DlState::None
        }
    }

    /// Promote a direction to an externally observed level (the
    /// `data_limit_notify` path). Returns the newly reached level, or
    /// `DlState::None` if it was already at or above it.
    pub fn update_state(&mut self, mode: DlMode, level: DlState) -> DlState {
        let dir = self.dir_mut(mode);
        if level > dir.level {
            dir.level = level;
            level
        } else {
            DlState::None
        }
    }

    /// Has at least one packet been received and decrypted under this key?
    pub fn is_decrypt_green(&self) -> bool {
        self.decrypt.level >= DlState::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openvpn::tls_auth::{INVERSE, NORMAL};

    fn pair(cipher: Cipher) -> (Box<dyn DcInstance>, Box<dyn DcInstance>) {
        let settings = DcSettings {
            cipher,
            digest: Digest::None,
        };
        let key = OpenVPNStaticKey::random();
        let f = RingDcFactory;
        let client = f
            .new_instance(&settings, &key, NORMAL, PidMode::Udp, 0)
            .unwrap();
        let server = f
            .new_instance(&settings, &key, INVERSE, PidMode::Udp, 0)
            .unwrap();
        (client, server)
    }

    #[test]
    fn aead_roundtrip_across_mirrored_instances() {
        let (mut client, mut server) = pair(Cipher::Aes256Gcm);
        let head = [0x30];

        let mut buf = Buffer::from_slice(b"ping me");
        client.encrypt(&mut buf, &head).unwrap();
        assert_eq!(buf.len(), 4 + 7 + TAG_LEN);

        server.decrypt(&mut buf, &head).unwrap();
        assert_eq!(buf.as_slice(), b"ping me");

        // And the other direction.
        let mut buf = Buffer::from_slice(b"pong");
        server.encrypt(&mut buf, &head).unwrap();
        client.decrypt(&mut buf, &head).unwrap();
        assert_eq!(buf.as_slice(), b"pong");
    }

    #[test]
    fn aead_rejects_replay_and_corruption() {
        let (mut client, mut server) = pair(Cipher::ChaCha20Poly1305);
        let head = [0x30];

        let mut buf = Buffer::from_slice(b"data");
        client.encrypt(&mut buf, &head).unwrap();
        let wire = buf.as_slice().to_vec();

        let mut once = Buffer::from_slice(&wire);
        server.decrypt(&mut once, &head).unwrap();

        let mut again = Buffer::from_slice(&wire);
        assert_eq!(server.decrypt(&mut again, &head), Err(Error::Replay));

        let mut corrupt = wire.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 1;
        let mut c = Buffer::from_slice(&corrupt);
        assert_eq!(server.decrypt(&mut c, &head), Err(Error::Decrypt));

        // Wrong AAD (head) also fails authentication.
        let mut b = Buffer::from_slice(&wire);
        assert_eq!(server.decrypt(&mut b, &[0x31]), Err(Error::Decrypt));
    }

    #[test]
    fn cbc_ciphers_are_not_instantiable() {
        let settings = DcSettings {
            cipher: Cipher::BfCbc,
            digest: Digest::Sha1,
        };
        let key = OpenVPNStaticKey::random();
        let err = RingDcFactory
            .new_instance(&settings, &key, NORMAL, PidMode::Udp, 0)
            .err()
            .unwrap();
        assert!(matches!(err, OptionError::UnsupportedCipher(_)));
    }

    #[test]
    fn data_limit_levels() {
        let mut dl = DataLimit::new(1000);
        assert!(!dl.is_decrypt_green());
        assert_eq!(dl.add(DlMode::Decrypt, 100), DlState::Green);
        assert!(dl.is_decrypt_green());
        assert_eq!(dl.add(DlMode::Decrypt, 100), DlState::None);
        assert_eq!(dl.add(DlMode::Decrypt, 1000), DlState::Red);
        assert_eq!(dl.add(DlMode::Decrypt, 1), DlState::None);

        // Directions are independent.
        assert_eq!(dl.add(DlMode::Encrypt, 2000), DlState::Red);

        let mut dl = DataLimit::new(1000);
        assert_eq!(dl.update_state(DlMode::Decrypt, DlState::Green), DlState::Green);
        assert_eq!(dl.update_state(DlMode::Decrypt, DlState::Green), DlState::None);
    }
}
