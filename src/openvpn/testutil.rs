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

//! Test collaborators: a deterministic mock TLS, a stand-in data channel
//! factory for the out-of-scope legacy ciphers, an in-memory host, and a
//! two-peer pump harness with a manual clock.

use std::collections::VecDeque;
use std::sync::Arc;

use ring::constant_time::verify_slices_are_equal;
use ring::hmac;

use crate::buffer::Buffer;
use crate::openvpn::data_channel::{DcFactory, DcInstance, DcSettings};
use crate::openvpn::error::{Error, OptionError};
use crate::openvpn::key_state::write_auth_string;
use crate::openvpn::options::{Config, OptionList};
use crate::openvpn::packet_id::{PacketId, PacketIdSend, PidMode, ReplayWindow};
use crate::openvpn::session::{ProtoContext, ProtoHost};
use crate::openvpn::tls::{TlsFactory, TlsSession};
use crate::openvpn::tls_auth::{OpenVPNStaticKey, CIPHER, DECRYPT, ENCRYPT, HMAC};
use crate::openvpn::Mode;
use crate::time::{Duration, Time};

// ---- mock TLS -----------------------------------------------------------

const REC_HELLO: u8 = 1;
const REC_DONE: u8 = 2;
const REC_APP: u8 = 3;

/// Produces [`MockTls`] sessions: a two-record handshake followed by
/// record-framed cleartext passthrough. Good enough to exercise every
/// control channel path without a real TLS stack.
#[derive(Debug, Default)]
pub struct MockTlsFactory;

impl TlsFactory for MockTlsFactory {
    fn new_session(&self, mode: Mode) -> Box<dyn TlsSession> {
        Box::new(MockTls {
            server: mode.is_server(),
            started: false,
            done: false,
            got_hello: false,
            ct_in: Vec::new(),
            ct_out: VecDeque::new(),
            clear_out: VecDeque::new(),
            clear_pending: Vec::new(),
        })
    }
}

pub struct MockTls {
    server: bool,
    started: bool,
    done: bool,
    got_hello: bool,
    ct_in: Vec<u8>,
    ct_out: VecDeque<Vec<u8>>,
    clear_out: VecDeque<Vec<u8>>,
    clear_pending: Vec<Vec<u8>>,
}

fn record(rec_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.push(rec_type);
    out.extend_from_slice(payload);
    out
}

impl MockTls {
    fn process(&mut self) -> Result<(), Error> {
        loop {
            if self.ct_in.len() < 3 {
                return Ok(());
            }
            let len = u16::from_be_bytes([self.ct_in[0], self.ct_in[1]]) as usize;
            if self.ct_in.len() < 3 + len {
                return Ok(());
            }
            let rec_type = self.ct_in[2];
            let payload: Vec<u8> = self.ct_in.drain(..3 + len).skip(3).collect();
            match rec_type {
                REC_HELLO => {
                    self.got_hello = true;
                    self.maybe_respond();
                }
                REC_DONE => {
                    if !self.server {
                        self.done = true;
                        self.flush_pending();
                    }
                }
                REC_APP => self.clear_out.push_back(payload),
                _ => return Err(Error::Tls),
            }
        }
    }

    fn maybe_respond(&mut self) {
        if self.server && self.started && self.got_hello && !self.done {
            self.ct_out.push_back(record(REC_DONE, &[]));
            self.done = true;
            self.flush_pending();
        }
    }

    fn flush_pending(&mut self) {
        for data in std::mem::take(&mut self.clear_pending) {
            self.ct_out.push_back(record(REC_APP, &data));
        }
    }
}

impl TlsSession for MockTls {
    fn start_handshake(&mut self) -> Result<(), Error> {
        self.started = true;
        if self.server {
            // Peer records may already be buffered.
            self.maybe_respond();
        } else {
            self.ct_out.push_back(record(REC_HELLO, &[]));
        }
        Ok(())
    }

    fn handshake_done(&self) -> bool {
        self.done
    }

    fn write_ciphertext(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ct_in.extend_from_slice(data);
        self.process()
    }

    fn read_ciphertext(&mut self) -> Option<Vec<u8>> {
        self.ct_out.pop_front()
    }

    fn write_cleartext(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.done {
            self.ct_out.push_back(record(REC_APP, data));
        } else {
            self.clear_pending.push(data.to_vec());
        }
        Ok(())
    }

    fn read_cleartext(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.clear_out.pop_front())
    }
}

// ---- stand-in data channel ----------------------------------------------

/// Accepts any cipher and builds a keystream-XOR instance authenticated
/// with HMAC-SHA1, with real packet IDs and replay protection. Stands in
/// for the legacy CBC constructions the default factory cannot build, so
/// the data-limit machinery can be driven end to end.
#[derive(Debug, Default)]
pub struct TestDcFactory;

impl DcFactory for TestDcFactory {
    fn new_instance(
        &self,
        _settings: &DcSettings,
        key: &OpenVPNStaticKey,
        dir: u8,
        pid_mode: PidMode,
        _key_id: u8,
    ) -> Result<Box<dyn DcInstance>, OptionError> {
        let mut enc_key = [0u8; 16];
        let mut dec_key = [0u8; 16];
        enc_key.copy_from_slice(&key.slice(CIPHER | ENCRYPT | dir)[..16]);
        dec_key.copy_from_slice(&key.slice(CIPHER | DECRYPT | dir)[..16]);
        let alg = hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY;
        Ok(Box::new(TestDcInstance {
            enc_key,
            dec_key,
            mac_send: hmac::Key::new(alg, &key.slice(HMAC | ENCRYPT | dir)[..20]),
            mac_recv: hmac::Key::new(alg, &key.slice(HMAC | DECRYPT | dir)[..20]),
            pid_send: PacketIdSend::new(false),
            replay: ReplayWindow::new(pid_mode),
        }))
    }
}

const TEST_MAC_LEN: usize = 20;

struct TestDcInstance {
    enc_key: [u8; 16],
    dec_key: [u8; 16],
    mac_send: hmac::Key,
    mac_recv: hmac::Key,
    pid_send: PacketIdSend,
    replay: ReplayWindow,
}

fn xor_keystream(data: &mut [u8], key: &[u8; 16], pid: &[u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % key.len()] ^ pid[i % pid.len()];
    }
}

fn test_mac(key: &hmac::Key, head: &[u8], pid: &[u8; 4], ct: &[u8]) -> hmac::Tag {
    let mut ctx = hmac::Context::with_key(key);
    ctx.update(head);
    ctx.update(pid);
    ctx.update(ct);
    ctx.sign()
}

impl DcInstance for TestDcInstance {
    fn encrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<bool, Error> {
        let (pid, wrap) = self.pid_send.next(0);
        let pid_bytes = pid.id.to_be_bytes();
        xor_keystream(buf.as_mut_slice(), &self.enc_key, &pid_bytes);
        let tag = test_mac(&self.mac_send, head, &pid_bytes, buf.as_slice());
        buf.append(tag.as_ref());
        buf.prepend(&pid_bytes);
        Ok(wrap)
    }

    fn decrypt(&mut self, buf: &mut Buffer, head: &[u8]) -> Result<(), Error> {
        let pid_bytes: [u8; 4] = buf.read_array().map_err(|_| Error::Buffer)?;
        if buf.len() < TEST_MAC_LEN {
            return Err(Error::Buffer);
        }
        let ct_len = buf.len() - TEST_MAC_LEN;
        let tag = test_mac(&self.mac_recv, head, &pid_bytes, &buf.as_slice()[..ct_len]);
        if verify_slices_are_equal(tag.as_ref(), &buf.as_slice()[ct_len..]).is_err() {
            return Err(Error::Hmac);
        }
        buf.truncate(ct_len);
        xor_keystream(buf.as_mut_slice(), &self.dec_key, &pid_bytes);

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

// ---- in-memory host ------------------------------------------------------

#[derive(Default)]
pub struct TestHost {
    /// Framed packets awaiting "transmission".
    pub out: VecDeque<Vec<u8>>,
    /// App-level control messages received.
    pub app_in: Vec<Vec<u8>>,
    /// Decrypted data packets received (filled by the harness).
    pub data_in: Vec<Vec<u8>>,
    pub active_count: u32,
    /// Client credentials to transmit.
    pub creds: Option<(String, String)>,
    /// What the server saw from `server_auth`.
    pub auth_seen: Option<(String, String, String)>,
}

impl ProtoHost for TestHost {
    fn control_net_send(&mut self, buf: &[u8]) {
        self.out.push_back(buf.to_vec());
    }

    fn control_recv(&mut self, msg: Vec<u8>) {
        self.app_in.push(msg);
    }

    fn client_auth(&mut self, buf: &mut Buffer) {
        let (user, pass) = self.creds.clone().unwrap_or_default();
        write_auth_string(user.as_bytes(), buf).unwrap();
        write_auth_string(pass.as_bytes(), buf).unwrap();
    }

    fn server_auth(
        &mut self,
        username: String,
        password: String,
        peer_info: String,
        _cert: Option<Vec<u8>>,
    ) {
        self.auth_seen = Some((username, password, peer_info));
    }

    fn active(&mut self) {
        self.active_count += 1;
    }
}

// ---- two-peer harness ----------------------------------------------------

/// Build a (client, server) config pair over the mock TLS and the stand-in
/// data channel factory. `opts` are applied to both sides.
pub fn config_pair(opts: &OptionList) -> (Config, Config) {
    let tls: Arc<MockTlsFactory> = Arc::new(MockTlsFactory);
    let mut cc = Config::new(tls.clone());
    cc.dc_factory = Arc::new(TestDcFactory);
    cc.load(opts, false).unwrap();
    let mut sc = Config::new(tls);
    sc.dc_factory = Arc::new(TestDcFactory);
    sc.load(opts, true).unwrap();
    (cc, sc)
}

pub fn base_opts() -> OptionList {
    let mut opt = OptionList::new();
    opt.push("dev", &["tun0"]);
    opt
}

/// A client and a server wired back to back with a manual clock.
pub struct Pair {
    pub client: ProtoContext<TestHost>,
    pub server: ProtoContext<TestHost>,
    pub now: Time,
    /// Simulate a dead link: pumped packets are discarded.
    pub drop_all: bool,
}

impl Pair {
    pub fn new(client_config: Config, server_config: Config) -> Pair {
        let mut pair = Pair {
            client: ProtoContext::new(client_config, Mode::Client, TestHost::default()),
            server: ProtoContext::new(server_config, Mode::Server, TestHost::default()),
            now: Time::from_secs(1),
            drop_all: false,
        };
        pair.client.reset().unwrap();
        pair.server.reset().unwrap();
        pair.set_now(pair.now);
        pair
    }

    pub fn with_opts(opts: &OptionList) -> Pair {
        let (cc, sc) = config_pair(opts);
        Pair::new(cc, sc)
    }

    pub fn set_now(&mut self, t: Time) {
        self.now = t;
        self.client.update_now(t);
        self.server.update_now(t);
    }

    /// Kick off the client handshake and pump until the link is quiet.
    pub fn start(&mut self) {
        self.client.start();
        self.client.flush(true);
        self.pump();
    }

    /// Deliver queued packets in both directions until none move.
    pub fn pump(&mut self) {
        for _ in 0..1000 {
            let mut moved = false;
            while let Some(p) = self.client.host_mut().out.pop_front() {
                moved = true;
                if !self.drop_all {
                    deliver(&mut self.server, &p);
                }
            }
            while let Some(p) = self.server.host_mut().out.pop_front() {
                moved = true;
                if !self.drop_all {
                    deliver(&mut self.client, &p);
                }
            }
            if !moved {
                return;
            }
        }
        panic!("pump did not converge");
    }

    fn next_housekeeping(&self) -> Time {
        let mut t = Time::INFINITE;
        if !self.client.invalidated() {
            t = t.min(self.client.next_housekeeping());
        }
        if !self.server.invalidated() {
            t = t.min(self.server.next_housekeeping());
        }
        t
    }

    /// Advance the clock by `d`, running housekeeping at each deadline and
    /// pumping the link.
    pub fn run_for(&mut self, d: Duration) {
        let end = self.now + d;
        for _ in 0..100_000 {
            let nh = self.next_housekeeping();
            if nh > end {
                break;
            }
            let t = nh.max(self.now);
            self.set_now(t);
            if !self.client.invalidated() {
                self.client.housekeeping();
            }
            if !self.server.invalidated() {
                self.server.housekeeping();
            }
            self.pump();
            if self.client.invalidated() && self.server.invalidated() {
                break;
            }
        }
        self.set_now(end);
    }

    /// Encrypt `payload` on one side, deliver it to the other, and return
    /// what came out of the tunnel (`Some(vec![])` for swallowed
    /// keepalives; `None` when nothing could be sent or decrypt failed).
    pub fn send_data(&mut self, from_client: bool, payload: &[u8]) -> Option<Vec<u8>> {
        let (src, dst) = if from_client {
            (&mut self.client, &mut self.server)
        } else {
            (&mut self.server, &mut self.client)
        };
        let mut buf = src.config().frame.prepare_with(payload);
        src.data_encrypt(&mut buf);
        if buf.is_empty() {
            return None;
        }
        let wire = buf.as_slice().to_vec();

        let t = dst.packet_type(&wire);
        let mut rbuf = Buffer::from_slice(&wire);
        let ok = dst.data_decrypt(&t, &mut rbuf);
        dst.flush(false);
        if !ok {
            return None;
        }
        Some(rbuf.as_slice().to_vec())
    }
}

/// Route one wire packet into a context the way a host would.
pub fn deliver(to: &mut ProtoContext<TestHost>, pkt: &[u8]) {
    let t = to.packet_type(pkt);
    if t.is_control() {
        to.control_net_recv(&t, Buffer::from_slice(pkt));
        to.flush(true);
    } else if t.is_data() {
        let mut buf = Buffer::from_slice(pkt);
        if to.data_decrypt(&t, &mut buf) && !buf.is_empty() {
            let data = buf.as_slice().to_vec();
            to.host_mut().data_in.push(data);
        }
        to.flush(false);
    }
}
