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

//! Session key derivation for key-method 2.
//!
//! The client contributes a 48-byte pre-master secret plus two 32-byte
//! randoms; the server contributes two 32-byte randoms. Both sides then run
//! the TLS 1.0 PRF (P_MD5 xor P_SHA1) twice to expand 256 bytes of
//! bidirectional key material, bound to both session IDs.

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;

use crate::buffer::{BufResult, Buffer};
use crate::openvpn::error::Error;
use crate::openvpn::psid::Psid;
use crate::openvpn::tls_auth::OpenVPNStaticKey;

const PRE_MASTER_SIZE: usize = 48;
const RANDOM_SIZE: usize = 32;
const MASTER_SIZE: usize = 48;

const LABEL_MASTER: &[u8] = b"OpenVPN master secret";
const LABEL_EXPANSION: &[u8] = b"OpenVPN key expansion";

/// P_hash expansion from RFC 2246, XORed into `out`.
macro_rules! p_hash {
    ($mac:ty, $secret:expr, $seed:expr, $out:expr) => {{
        let secret: &[u8] = $secret;
        let seed: &[u8] = $seed;
        let out: &mut [u8] = &mut *$out;
        let mac = |key: &[u8], parts: &[&[u8]]| {
            let mut m = <$mac>::new_from_slice(key).expect("HMAC accepts any key length");
            for p in parts {
                m.update(p);
            }
            m.finalize().into_bytes()
        };
        let mut a = mac(secret, &[seed]).to_vec();
        let mut off = 0;
        while off < out.len() {
            let block = mac(secret, &[a.as_slice(), seed]);
            let n = block.len().min(out.len() - off);
            for i in 0..n {
                out[off + i] ^= block[i];
            }
            off += n;
            a = mac(secret, &[a.as_slice()]).to_vec();
        }
    }};
}

/// TLS 1.0 PRF: split the secret into two overlapping halves and XOR the
/// MD5- and SHA1-based expansions.
fn tls1_prf(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) {
    out.iter_mut().for_each(|b| *b = 0);
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label);
    full_seed.extend_from_slice(seed);

    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];
    p_hash!(Hmac<Md5>, s1, &full_seed, out);
    p_hash!(Hmac<Sha1>, s2, &full_seed, out);
}

/// One side's PRF state for a single key negotiation.
pub struct TlsPrf {
    server: bool,
    pre_master: [u8; PRE_MASTER_SIZE],
    random1: [u8; RANDOM_SIZE],
    random2: [u8; RANDOM_SIZE],
    peer_pre_master: [u8; PRE_MASTER_SIZE],
    peer_random1: [u8; RANDOM_SIZE],
    peer_random2: [u8; RANDOM_SIZE],
    peer_received: bool,
}

impl TlsPrf {
    pub fn is_server(&self) -> bool {
        self.server
    }

    pub fn new(server: bool) -> TlsPrf {
        TlsPrf {
            server,
            pre_master: [0; PRE_MASTER_SIZE],
            random1: [0; RANDOM_SIZE],
            random2: [0; RANDOM_SIZE],
            peer_pre_master: [0; PRE_MASTER_SIZE],
            peer_random1: [0; RANDOM_SIZE],
            peer_random2: [0; RANDOM_SIZE],
            peer_received: false,
        }
    }

    /// Draw fresh randoms for our half of the exchange.
    pub fn self_randomize(&mut self) {
        if !self.server {
            OsRng.fill_bytes(&mut self.pre_master);
        }
        OsRng.fill_bytes(&mut self.random1);
        OsRng.fill_bytes(&mut self.random2);
    }

    /// Size of the random block the peer will send us.
    pub fn peer_read_size(&self) -> usize {
        if self.server {
            PRE_MASTER_SIZE + 2 * RANDOM_SIZE
        } else {
            2 * RANDOM_SIZE
        }
    }

    /// Append our random block to the auth message.
    pub fn self_write(&self, buf: &mut Buffer) {
        if !self.server {
            buf.append(&self.pre_master);
        }
        buf.append(&self.random1);
        buf.append(&self.random2);
    }

    /// Consume the peer's random block from the auth message.
    pub fn peer_read(&mut self, buf: &mut Buffer) -> BufResult<()> {
        if self.server {
            self.peer_pre_master = buf.read_array()?;
        }
        self.peer_random1 = buf.read_array()?;
        self.peer_random2 = buf.read_array()?;
        self.peer_received = true;
        Ok(())
    }

    /// Expand the exchanged randoms into 256 bytes of data channel key
    /// material. Client inputs always come first, so both sides derive the
    /// same block and address it with mirrored slot orientations.
    pub fn generate_key_expansion(
        &self,
        psid_self: &Psid,
        psid_peer: &Psid,
    ) -> Result<OpenVPNStaticKey, Error> {
        if !self.peer_received {
            return Err(Error::Tls);
        }
        let (pre_master, cr1, cr2, c_psid, sr1, sr2, s_psid) = if self.server {
            (
                &self.peer_pre_master,
                &self.peer_random1,
                &self.peer_random2,
                psid_peer,
                &self.random1,
                &self.random2,
                psid_self,
            )
        } else {
            (
                &self.pre_master,
                &self.random1,
                &self.random2,
                psid_self,
                &self.peer_random1,
                &self.peer_random2,
                psid_peer,
            )
        };

        let mut master = [0u8; MASTER_SIZE];
        let mut seed = Vec::with_capacity(2 * RANDOM_SIZE);
        seed.extend_from_slice(cr1);
        seed.extend_from_slice(sr1);
        tls1_prf(pre_master, LABEL_MASTER, &seed, &mut master);

        let mut out = [0u8; OpenVPNStaticKey::SIZE];
        let mut seed = Vec::with_capacity(2 * RANDOM_SIZE + 2 * Psid::SIZE);
        seed.extend_from_slice(cr2);
        seed.extend_from_slice(sr2);
        seed.extend_from_slice(c_psid.as_slice());
        seed.extend_from_slice(s_psid.as_slice());
        tls1_prf(&master, LABEL_EXPANSION, &seed, &mut out);

        master.iter_mut().for_each(|b| *b = 0);
        Ok(OpenVPNStaticKey::from_bytes(out))
    }

    /// Wipe all key material once the expansion is done.
    pub fn erase(&mut self) {
        self.pre_master = [0; PRE_MASTER_SIZE];
        self.random1 = [0; RANDOM_SIZE];
        self.random2 = [0; RANDOM_SIZE];
        self.peer_pre_master = [0; PRE_MASTER_SIZE];
        self.peer_random1 = [0; RANDOM_SIZE];
        self.peer_random2 = [0; RANDOM_SIZE];
        self.peer_received = false;
    }
}
