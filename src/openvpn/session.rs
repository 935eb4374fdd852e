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

//! The protocol context: owns the primary/secondary key contexts,
//! classifies incoming packets, dispatches lifecycle events, and drives
//! keepalive. One instance is one protocol session endpoint.

use std::fmt::Write as _;

use crate::buffer::Buffer;
use crate::openvpn::data_channel::{DlMode, DlState};
use crate::openvpn::error::{Error, OptionError, SessionStats};
use crate::openvpn::key_state::{write_empty_string, Event, KeyContext};
use crate::openvpn::options::{Config, OptionList};
use crate::openvpn::packet::{
    self, key_id_extract, opcode_extract, opcode_name, Packet, PacketType, ACK_V1, DATA_V1,
    DATA_V2, KEY_ID_MASK,
};
use crate::openvpn::packet_id::{PacketId, PacketIdSend, ReplayWindow};
use crate::openvpn::psid::Psid;
use crate::openvpn::reliable::AckList;
use crate::openvpn::tls_auth::TlsAuth;
use crate::openvpn::{is_keepalive, Mode};
use crate::time::{Duration, Time};

/// Callbacks the host must implement. The engine performs no I/O; these are
/// its only way out.
pub trait ProtoHost {
    /// Transmit one framed packet (control or data) to the peer.
    fn control_net_send(&mut self, buf: &[u8]);

    /// An app-level control message arrived from the peer. Messages are
    /// delimited by their null terminator, which is included, so the bytes
    /// equal what the peer passed to `control_send`.
    fn control_recv(&mut self, msg: Vec<u8>);

    /// Client only: append username and password auth strings to the auth
    /// message (see `write_auth_string`). The default sends empty creds.
    fn client_auth(&mut self, buf: &mut Buffer) {
        write_empty_string(buf);
        write_empty_string(buf);
    }

    /// Server only: credentials and peer info received from the client,
    /// plus the peer certificate if the TLS layer exposes one.
    fn server_auth(
        &mut self,
        _username: String,
        _password: String,
        _peer_info: String,
        _cert: Option<Vec<u8>>,
    ) {
    }

    /// The initial key context reached ACTIVE.
    fn active(&mut self) {}
}

/// tls-auth state of a session: the HMAC pair plus the long-form packet ID
/// send counter and receive replay window.
pub struct TlsWrap {
    pub hmac: TlsAuth,
    pub pid_send: PacketIdSend,
    pub pid_recv: ReplayWindow,
}

/// Session state shared between the protocol context and its key contexts.
/// Key context methods borrow it for the duration of a call; there is no
/// ownership cycle.
pub struct SessionShared {
    pub config: Config,
    pub stats: SessionStats,
    pub mode: Mode,
    pub now: Time,
    pub psid_self: Psid,
    pub psid_peer: Option<Psid>,
    pub ta: Option<TlsWrap>,
    pub upcoming_key_id: u8,
    pub n_key_ids: u32,
    pub keepalive_xmit: Time,
    pub keepalive_expire: Time,
    pub dc_deferred: bool,
    pub slowest_handshake: Duration,
}

impl SessionShared {
    pub fn is_server(&self) -> bool {
        self.mode.is_server()
    }

    pub fn is_tcp(&self) -> bool {
        self.config.proto.is_tcp()
    }

    /// Push the keepalive expiration out after an authenticated receive.
    pub fn update_last_received(&mut self) {
        self.keepalive_expire = self.now + self.config.keepalive_timeout;
    }

    /// Reschedule the next keepalive transmit after a send.
    pub fn update_last_sent(&mut self) {
        self.keepalive_xmit = self.now + self.config.keepalive_ping;
    }

    /// Key ids start at 0, cycle through 1..7, and never return to 0.
    pub fn next_key_id(&mut self) -> u8 {
        self.n_key_ids += 1;
        let ret = self.upcoming_key_id;
        self.upcoming_key_id = (self.upcoming_key_id + 1) & KEY_ID_MASK;
        if self.upcoming_key_id == 0 {
            self.upcoming_key_id = 1;
        }
        ret
    }

    fn debug_prefix(&self) -> String {
        format!(
            "{} {}",
            self.now.millis(),
            if self.is_server() { "SERVER" } else { "CLIENT" }
        )
    }
}

/// The OpenVPN protocol engine for one session.
pub struct ProtoContext<H: ProtoHost> {
    sh: SessionShared,
    host: H,
    primary: Option<KeyContext>,
    secondary: Option<KeyContext>,
}

impl<H: ProtoHost> ProtoContext<H> {
    pub fn new(config: Config, mode: Mode, host: H) -> ProtoContext<H> {
        ProtoContext {
            sh: SessionShared {
                config,
                stats: SessionStats::new(),
                mode,
                now: Time::ZERO,
                psid_self: Psid::random(),
                psid_peer: None,
                ta: None,
                upcoming_key_id: 0,
                n_key_ids: 0,
                keepalive_xmit: Time::INFINITE,
                keepalive_expire: Time::INFINITE,
                dc_deferred: false,
                slowest_handshake: Duration::ZERO,
            },
            host,
            primary: None,
            secondary: None,
        }
    }

    /// Begin a fresh session: randomize our PSID, reset tls-auth state and
    /// allocate the primary key context (key id 0).
    pub fn reset(&mut self) -> Result<(), OptionError> {
        self.primary = None;
        self.secondary = None;

        let c = &self.sh.config;
        self.sh.dc_deferred = c.dc_deferred;
        self.sh.upcoming_key_id = 0;
        self.sh.n_key_ids = 0;

        self.sh.ta = match &c.tls_auth_key {
            Some(key) => Some(TlsWrap {
                hmac: TlsAuth::new(key, c.key_direction, c.tls_auth_digest)?,
                pid_send: PacketIdSend::new(true),
                pid_recv: ReplayWindow::new(c.pid_mode),
            }),
            None => None,
        };

        self.sh.psid_self = Psid::random();
        self.sh.psid_peer = None;

        let initiator = self.sh.mode.is_client();
        let primary = KeyContext::new(&mut self.sh, initiator);
        log::debug!(
            "{}: new primary key context id={}",
            self.sh.debug_prefix(),
            primary.key_id()
        );
        self.primary = Some(primary);

        self.sh.keepalive_expire = Time::INFINITE;
        self.sh.update_last_sent();
        Ok(())
    }

    /// Client: send the initial hard reset.
    pub fn start(&mut self) {
        if let Some(p) = &mut self.primary {
            p.start(&mut self.sh);
            // Upper bound on when we expect the server's answer.
            self.sh.update_last_received();
        }
    }

    /// Classify an incoming packet before any cryptographic work.
    pub fn packet_type(&self, buf: &[u8]) -> PacketType {
        packet::classify(
            buf,
            self.sh.mode,
            self.primary.as_ref().map(|k| k.key_id()),
            self.secondary.as_ref().map(|k| k.key_id()),
            self.sh.upcoming_key_id,
        )
    }

    /// Validate a control packet's integrity without mutating any state.
    pub fn control_net_validate(&self, t: &PacketType, buf: &[u8]) -> bool {
        t.is_defined() && KeyContext::validate(buf, &self.sh)
    }

    /// Feed one inbound control channel packet. Returns whether a control
    /// message was accepted into the receive window.
    pub fn control_net_recv(&mut self, t: &PacketType, buf: Buffer) -> bool {
        if !t.is_control() {
            return false;
        }
        let pkt = Packet::new(t.opcode, buf);
        if t.is_soft_reset() && !self.renegotiate_request(&pkt) {
            return false;
        }
        let key = if t.is_secondary() {
            self.secondary.as_mut()
        } else {
            self.primary.as_mut()
        };
        let key = match key {
            Some(k) => k,
            None => return false,
        };
        match key.net_recv(&mut self.sh, &mut self.host, pkt) {
            Ok(accepted) => accepted,
            Err(e) => {
                self.sh.stats.error(e);
                key.invalidate(e);
                false
            }
        }
    }

    /// Encrypt and frame one outbound data packet in place, using the
    /// primary key. Clears the buffer when no key is ready; the caller must
    /// drop empty results.
    pub fn data_encrypt(&mut self, buf: &mut Buffer) {
        match &mut self.primary {
            Some(p) => {
                if let Err(e) = p.encrypt(&mut self.sh, buf) {
                    self.sh.stats.error(e);
                    buf.clear();
                }
            }
            None => buf.clear(),
        }
    }

    /// Decrypt one inbound data packet in place, selecting the key context
    /// by the packet's key id. Returns whether an authenticated packet was
    /// received; keepalive markers are swallowed after updating the
    /// last-received time.
    pub fn data_decrypt(&mut self, t: &PacketType, buf: &mut Buffer) -> bool {
        if !t.is_data() {
            buf.clear();
            return false;
        }
        let key = if t.is_secondary() {
            self.secondary.as_mut()
        } else {
            self.primary.as_mut()
        };
        let key = match key {
            Some(k) => k,
            None => {
                buf.clear();
                return false;
            }
        };
        key.decrypt(&mut self.sh, buf);

        let mut ret = false;
        if !buf.is_empty() {
            self.sh.update_last_received();
            ret = true;
        }
        if is_keepalive(buf.as_slice()) {
            buf.clear();
        }
        ret
    }

    /// Queue an app-level control message (bounded at [`crate::openvpn::APP_MSG_MAX`]).
    /// Control sends always use the primary, even while a fresher secondary
    /// is waiting for its promotion.
    pub fn control_send(&mut self, msg: &[u8]) {
        let buf = self.sh.config.frame.prepare_with(msg);
        match &mut self.primary {
            Some(p) => {
                if let Err(e) = p.app_send(buf) {
                    self.sh.stats.error(e);
                }
            }
            None => log::warn!("control_send: no primary key"),
        }
    }

    /// Drain pending events and emit queued packets. Should be called at
    /// the end of a batch of operations; `control_channel` forces a full
    /// flush.
    pub fn flush(&mut self, control_channel: bool) {
        if control_channel || self.process_events() {
            loop {
                self.flush_keys();
                if !self.process_events() {
                    break;
                }
            }
        }
    }

    fn flush_keys(&mut self) {
        if let Some(p) = &mut self.primary {
            if let Err(e) = p.flush(&mut self.sh, &mut self.host) {
                self.sh.stats.error(e);
                p.invalidate(e);
            }
        }
        if let Some(s) = &mut self.secondary {
            if let Err(e) = s.flush(&mut self.sh, &mut self.host) {
                self.sh.stats.error(e);
                s.invalidate(e);
            }
        }
    }

    /// Retransmission, event processing and keepalive. Call at (or after)
    /// the time returned by `next_housekeeping`.
    pub fn housekeeping(&mut self) {
        if let Some(p) = &mut self.primary {
            if let Err(e) = p.retransmit(&mut self.sh, &mut self.host) {
                self.sh.stats.error(e);
                p.invalidate(e);
            }
        }
        if let Some(s) = &mut self.secondary {
            if let Err(e) = s.retransmit(&mut self.sh, &mut self.host) {
                self.sh.stats.error(e);
                s.invalidate(e);
            }
        }
        self.flush(false);
        self.keepalive_housekeeping();
    }

    /// When `housekeeping` should next run. Returns the current time when
    /// the session has been invalidated.
    pub fn next_housekeeping(&self) -> Time {
        if self.invalidated() {
            return self.sh.now;
        }
        let mut t = Time::INFINITE;
        if let Some(p) = &self.primary {
            t = t.min(p.next_retransmit());
        }
        if let Some(s) = &self.secondary {
            t = t.min(s.next_retransmit());
        }
        t.min(self.sh.keepalive_xmit).min(self.sh.keepalive_expire)
    }

    fn keepalive_housekeeping(&mut self) {
        let now = self.sh.now;
        if now >= self.sh.keepalive_xmit {
            if let Some(p) = &mut self.primary {
                p.send_keepalive(&mut self.sh, &mut self.host);
            }
            self.sh.update_last_sent();
        }
        if now >= self.sh.keepalive_expire {
            // No contact with the peer.
            self.sh.stats.error(Error::KeepaliveTimeout);
            self.disconnect(Error::KeepaliveTimeout);
        }
    }

    /// Force a local rekey: create and start a secondary key context. Any
    /// previous secondary is wiped.
    pub fn renegotiate(&mut self) {
        if self.primary.is_none() {
            return;
        }
        self.new_secondary_key(true);
        if let Some(s) = &mut self.secondary {
            s.start(&mut self.sh);
        }
    }

    fn new_secondary_key(&mut self, initiator: bool) {
        let kc = KeyContext::new(&mut self.sh, initiator);
        log::debug!(
            "{}: new secondary key context id={} {}",
            self.sh.debug_prefix(),
            kc.key_id(),
            if initiator {
                "local-triggered"
            } else {
                "remote-triggered"
            }
        );
        self.secondary = Some(kc);
    }

    // A peer-originated soft reset: authenticate it before allocating the
    // secondary.
    fn renegotiate_request(&mut self, pkt: &Packet) -> bool {
        if KeyContext::validate(pkt.buf.as_slice(), &self.sh) {
            self.new_secondary_key(false);
            true
        } else {
            false
        }
    }

    fn promote_secondary_to_primary(&mut self) {
        std::mem::swap(&mut self.primary, &mut self.secondary);
        if let Some(s) = &mut self.secondary {
            s.prepare_expire(&self.sh, Event::None);
        }
        log::debug!("{}: promote secondary to primary", self.sh.debug_prefix());
    }

    fn process_events(&mut self) -> bool {
        let mut did_work = false;
        let pending = match &mut self.primary {
            Some(p) => p.event_pending(&mut self.sh),
            None => false,
        };
        if pending {
            self.process_primary_event();
            did_work = true;
        }
        let pending = match &mut self.secondary {
            Some(s) => s.event_pending(&mut self.sh),
            None => false,
        };
        if pending {
            self.process_secondary_event();
            did_work = true;
        }
        did_work
    }

    fn process_primary_event(&mut self) {
        let ev = match &mut self.primary {
            Some(p) => p.take_event(),
            None => return,
        };
        match ev {
            Event::Active => {
                log::debug!("{}: session active", self.sh.debug_prefix());
                self.host.active();
            }
            Event::Renegotiate | Event::RenegotiateForce => self.renegotiate(),
            Event::Expire => {
                if self.secondary.as_ref().map_or(false, |s| !s.invalidated()) {
                    self.promote_secondary_to_primary();
                } else {
                    // Primary expired with nothing to promote.
                    self.sh.stats.error(Error::PrimaryExpire);
                    self.disconnect(Error::PrimaryExpire);
                }
            }
            Event::Negotiate => {
                self.sh.stats.error(Error::HandshakeTimeout);
                self.disconnect(Error::HandshakeTimeout);
            }
            _ => {}
        }
        if let Some(p) = &mut self.primary {
            p.set_next_event_if_unspecified(&self.sh);
        }
    }

    fn process_secondary_event(&mut self) {
        let ev = match &mut self.secondary {
            Some(s) => s.take_event(),
            None => return,
        };
        match ev {
            Event::Active => {
                // A fresh key is ready; start retiring the primary.
                if let Some(p) = &mut self.primary {
                    p.prepare_expire(&self.sh, Event::None);
                }
            }
            Event::BecomePrimary => {
                if self.secondary.as_ref().map_or(false, |s| !s.invalidated()) {
                    self.promote_secondary_to_primary();
                }
            }
            Event::Expire => {
                self.secondary = None;
            }
            Event::RenegotiateQueue => {
                // Carry the queued rekey request over to the primary at the
                // moment this key would have been promoted.
                let t = self
                    .secondary
                    .as_ref()
                    .map_or(Time::INFINITE, |s| s.become_primary_time());
                if let Some(p) = &mut self.primary {
                    p.key_limit_reneg(&self.sh, Event::RenegotiateForce, t);
                }
            }
            // NEGOTIATE on a secondary records the timeout and then also
            // starts a fresh cycle through the shared arm below.
            Event::Negotiate => {
                self.sh.stats.error(Error::HandshakeTimeout);
                self.renegotiate();
            }
            Event::PrimaryPending | Event::RenegotiateForce => self.renegotiate(),
            _ => {}
        }
        if let Some(s) = &mut self.secondary {
            s.set_next_event_if_unspecified(&self.sh);
        }
    }

    /// Enter the disconnected state: both key contexts become terminal
    /// no-ops.
    pub fn disconnect(&mut self, reason: Error) {
        if let Some(p) = &mut self.primary {
            p.invalidate(reason);
        }
        if let Some(s) = &mut self.secondary {
            s.invalidate(reason);
        }
    }

    /// UDP clients: tell the server we are going away.
    pub fn send_explicit_exit_notify(&mut self) {
        if self.sh.mode.is_client() && self.sh.config.proto.is_udp() {
            if let Some(p) = &mut self.primary {
                p.send_explicit_exit_notify(&mut self.sh, &mut self.host);
            }
        }
    }

    /// Advance the engine clock. All waiting is modeled against this value.
    pub fn update_now(&mut self, now: Time) {
        self.sh.now = now;
    }

    pub fn now(&self) -> Time {
        self.sh.now
    }

    /// Hosts should call this after transmitting a packet, so keepalive
    /// pings only fill actual silence.
    pub fn update_last_sent(&mut self) {
        self.sh.update_last_sent();
    }

    pub fn invalidated(&self) -> bool {
        self.primary.as_ref().map_or(false, |p| p.invalidated())
    }

    pub fn invalidation_reason(&self) -> Option<Error> {
        self.primary.as_ref().and_then(|p| p.invalidation_reason())
    }

    /// Can `data_encrypt`/`data_decrypt` be used yet?
    pub fn data_channel_ready(&self) -> bool {
        self.primary.as_ref().map_or(false, |p| p.data_channel_ready())
    }

    /// Total number of key negotiations over the life of this context.
    pub fn negotiations(&self) -> u32 {
        self.sh.n_key_ids
    }

    /// Worst-case handshake duration seen so far.
    pub fn slowest_handshake(&self) -> Duration {
        self.sh.slowest_handshake
    }

    /// Late data channel initialization, e.g. on a client after the server
    /// push has settled the cipher.
    pub fn init_data_channel(&mut self) {
        self.sh.dc_deferred = false;
        if let Some(p) = &mut self.primary {
            if let Err(e) = p.init_data_channel(&mut self.sh) {
                self.sh.stats.error(e);
            }
        }
        if let Some(s) = &mut self.secondary {
            if let Err(e) = s.init_data_channel(&mut self.sh) {
                self.sh.stats.error(e);
            }
        }
    }

    /// Apply server-pushed options on the client.
    pub fn process_push(&mut self, opt: &OptionList) -> Result<(), OptionError> {
        self.sh.config.process_push(opt)?;
        self.keepalive_parms_modified();
        Ok(())
    }

    fn keepalive_parms_modified(&mut self) {
        self.sh.update_last_received();
        // Don't push the current transmit cycle back, only pull it forward.
        let kx = self.sh.now + self.sh.config.keepalive_ping;
        if kx < self.sh.keepalive_xmit {
            self.sh.keepalive_xmit = kx;
        }
    }

    pub fn is_keepalive_enabled(&self) -> bool {
        self.sh.config.is_keepalive_enabled()
    }

    /// Disable keepalive for the rest of the session, returning the
    /// previous (ping, timeout) parameters.
    pub fn disable_keepalive(&mut self) -> (Duration, Duration) {
        let prev = (
            self.sh.config.keepalive_ping,
            self.sh.config.keepalive_timeout,
        );
        self.sh.config.keepalive_ping = crate::time::DUR_INFINITE;
        self.sh.config.keepalive_timeout = crate::time::DUR_INFINITE;
        self.keepalive_parms_modified();
        prev
    }

    /// Notify the owning key context that a data limit level was observed.
    pub fn data_limit_notify(&mut self, key_id: u8, mode: DlMode, level: DlState) {
        if let Some(p) = &mut self.primary {
            if p.key_id() == key_id {
                p.data_limit_notify(&mut self.sh, mode, level);
                return;
            }
        }
        if let Some(s) = &mut self.secondary {
            if s.key_id() == key_id {
                s.data_limit_notify(&mut self.sh, mode, level);
            }
        }
    }

    pub fn mode(&self) -> Mode {
        self.sh.mode
    }

    pub fn stats(&self) -> &SessionStats {
        &self.sh.stats
    }

    pub fn config(&self) -> &Config {
        &self.sh.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.sh.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    #[cfg(test)]
    pub(crate) fn primary_key_id(&self) -> Option<u8> {
        self.primary.as_ref().map(|p| p.key_id())
    }

    #[cfg(test)]
    pub(crate) fn secondary_key_id(&self) -> Option<u8> {
        self.secondary.as_ref().map(|s| s.key_id())
    }

    /// Render a packet for debugging.
    pub fn dump_packet(&self, data: &[u8]) -> String {
        let mut out = String::new();
        match self.dump_packet_inner(data, &mut out) {
            Ok(()) => out,
            Err(_) => "BAD_PACKET".into(),
        }
    }

    fn dump_packet_inner(
        &self,
        data: &[u8],
        out: &mut String,
    ) -> Result<(), crate::buffer::BufferError> {
        let orig_size = data.len();
        let mut buf = Buffer::from_slice(data);
        let op = buf.read_u8()?;
        let opcode = opcode_extract(op);
        let name = opcode_name(opcode).ok_or(crate::buffer::BufferError)?;
        let _ = write!(out, "{}/{}", name, key_id_extract(op));

        if opcode == DATA_V1 || opcode == DATA_V2 {
            if opcode == DATA_V2 {
                let b = buf.read_slice(3)?;
                let peer_id = (u32::from(b[0]) << 16) + (u32::from(b[1]) << 8) + u32::from(b[2]);
                if peer_id != 0xFF_FFFF {
                    let _ = write!(out, " PEER_ID={}", peer_id);
                }
            }
            let _ = write!(out, " SIZE={}/{}", buf.len(), orig_size);
            return Ok(());
        }

        let src_psid = Psid::read(&mut buf)?;
        let _ = write!(out, " SRC_PSID={}", src_psid);
        if let Some(ta) = &self.sh.ta {
            let hmac = buf.read_slice(ta.hmac.size())?.to_vec();
            let _ = write!(out, " HMAC={}", hex::encode(hmac));
            let pid = PacketId::read_long(&mut buf)?;
            let _ = write!(out, " PID=[{} {}]", pid.time, pid.id);
        }
        let acks = AckList::read(&mut buf)?;
        let _ = write!(out, " ACK={:?}", acks);
        if !acks.is_empty() {
            let dest_psid = Psid::read(&mut buf)?;
            let _ = write!(out, " DEST_PSID={}", dest_psid);
        }
        if opcode != ACK_V1 {
            let _ = write!(out, " MSG_ID={}", buf.read_u32_be()?);
            let _ = write!(out, " SIZE={}/{}", buf.len(), orig_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::crypto::{Cipher, Digest};
    use crate::openvpn::data_channel::RingDcFactory;
    use crate::openvpn::packet::{opcode_extract, CONTROL_V1};
    use crate::openvpn::testutil::{base_opts, config_pair, deliver, Pair};
    use crate::openvpn::tls_auth::{KeyDirection, OpenVPNStaticKey};
    use crate::openvpn::{Proto, EXPLICIT_EXIT_NOTIFY_MESSAGE};

    fn handshaken_pair() -> Pair {
        let mut pair = Pair::with_opts(&base_opts());
        pair.start();
        pair
    }

    #[test]
    fn client_reset_is_op_0x38() {
        let mut pair = Pair::with_opts(&base_opts());
        pair.client.start();
        pair.client.flush(true);
        let first = pair.client.host().out.front().unwrap().clone();
        assert_eq!(first[0], 0x38);
        let t = pair.server.packet_type(&first);
        assert!(t.is_control() && !t.is_secondary());
    }

    #[test]
    fn happy_handshake_udp() {
        let mut pair = handshaken_pair();
        assert!(pair.client.data_channel_ready());
        assert!(pair.server.data_channel_ready());
        assert_eq!(pair.client.host().active_count, 1);
        assert_eq!(pair.server.host().active_count, 1);
        assert_eq!(pair.client.primary_key_id(), Some(0));
        assert_eq!(pair.server.primary_key_id(), Some(0));
        assert_eq!(pair.client.negotiations(), 1);

        // 100-byte ping, both directions.
        let payload = vec![0x42u8; 100];
        assert_eq!(pair.send_data(true, &payload).unwrap(), payload);
        assert_eq!(pair.send_data(false, &payload).unwrap(), payload);
    }

    #[test]
    fn handshake_survives_initial_loss() {
        let mut pair = Pair::with_opts(&base_opts());
        pair.drop_all = true;
        pair.start();
        assert!(!pair.client.data_channel_ready());
        // Link comes back; the reliability layer retransmits.
        pair.drop_all = false;
        pair.run_for(Duration::from_secs(5));
        assert!(pair.client.data_channel_ready());
        assert!(pair.server.data_channel_ready());
    }

    #[test]
    fn creds_and_peer_info_reach_the_server() {
        let mut pair = Pair::with_opts(&base_opts());
        pair.client.host_mut().creds = Some(("alice".into(), "s3cret".into()));
        pair.start();
        let (user, pass, peer_info) = pair.server.host().auth_seen.clone().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
        assert!(peer_info.contains("IV_PROTO=2\n"));
        assert!(peer_info.contains("IV_BS64DL=1\n"));
    }

    #[test]
    fn empty_creds_still_send_fields() {
        let (mut cc, sc) = config_pair(&base_opts());
        cc.xmit_creds = false;
        let mut pair = Pair::new(cc, sc);
        pair.start();
        let (user, pass, _) = pair.server.host().auth_seen.clone().unwrap();
        assert_eq!(user, "");
        assert_eq!(pass, "");
    }

    #[test]
    fn control_message_roundtrip() {
        let mut pair = handshaken_pair();
        pair.client.control_send(b"PUSH_REQUEST\0");
        pair.client.flush(true);
        pair.pump();
        assert_eq!(pair.server.host().app_in, vec![b"PUSH_REQUEST\0".to_vec()]);

        // A large reply crosses in the other direction byte for byte.
        let mut big = vec![0xABu8; 10_000];
        big.push(0);
        pair.server.control_send(&big);
        pair.server.flush(true);
        pair.pump();
        assert_eq!(pair.client.host().app_in, vec![big]);
    }

    #[test]
    fn control_messages_survive_reordering() {
        let mut pair = handshaken_pair();
        pair.client.control_send(b"first\0");
        pair.client.control_send(b"second\0");
        pair.client.flush(true);
        let a = pair.client.host_mut().out.pop_front().unwrap();
        let b = pair.client.host_mut().out.pop_front().unwrap();
        assert!(pair.client.host().out.is_empty());

        // Swapped on the wire; the reliability layer restores sequence.
        deliver(&mut pair.server, &b);
        assert!(pair.server.host().app_in.is_empty());
        deliver(&mut pair.server, &a);
        assert_eq!(
            pair.server.host().app_in,
            vec![b"first\0".to_vec(), b"second\0".to_vec()]
        );
    }

    #[test]
    fn control_send_before_active_is_queued() {
        let mut pair = Pair::with_opts(&base_opts());
        pair.client.control_send(b"early\0");
        pair.start();
        pair.pump();
        assert_eq!(pair.server.host().app_in, vec![b"early\0".to_vec()]);
    }

    fn tls_auth_pair() -> (Pair, Vec<u8>) {
        let (mut cc, mut sc) = config_pair(&base_opts());
        let key = OpenVPNStaticKey::random();
        cc.tls_auth_key = Some(key.clone());
        cc.key_direction = KeyDirection::Zero;
        sc.tls_auth_key = Some(key);
        sc.key_direction = KeyDirection::One;
        let mut pair = Pair::new(cc, sc);
        pair.client.start();
        pair.client.flush(true);
        let reset = pair.client.host().out.front().unwrap().clone();
        pair.pump();
        (pair, reset)
    }

    #[test]
    fn tls_auth_handshake_and_replayed_control_packet() {
        let (mut pair, reset) = tls_auth_pair();
        assert!(pair.client.data_channel_ready());
        assert!(pair.server.data_channel_ready());

        // Re-inject the already-accepted hard reset: counted as a replay,
        // but its message id is still ACKed so the peer cannot deadlock.
        let t = pair.server.packet_type(&reset);
        assert!(t.is_control());
        assert!(!pair.server.control_net_recv(&t, Buffer::from_slice(&reset)));
        assert_eq!(pair.server.stats().count(Error::Replay), 1);
        pair.server.flush(true);
        let acked = pair
            .server
            .host()
            .out
            .iter()
            .any(|p| opcode_extract(p[0]) == ACK_V1);
        assert!(acked);
        // The session is unharmed.
        pair.server.host_mut().out.clear();
        assert!(!pair.server.invalidated());
    }

    #[test]
    fn corrupted_control_packet_udp_vs_tcp() {
        // UDP: counted, session continues.
        let (mut pair, _) = tls_auth_pair();
        pair.client.control_send(b"hello\0");
        pair.client.flush(true);
        let mut pkt = pair.client.host_mut().out.pop_front().unwrap();
        assert_eq!(opcode_extract(pkt[0]), CONTROL_V1);
        let last = pkt.len() - 1;
        pkt[last] ^= 0x01;
        deliver(&mut pair.server, &pkt);
        assert_eq!(pair.server.stats().count(Error::Hmac), 1);
        assert!(!pair.server.invalidated());

        // TCP: the stream cannot resynchronize, so the context dies.
        let (mut cc, mut sc) = config_pair(&base_opts());
        let key = OpenVPNStaticKey::random();
        cc.tls_auth_key = Some(key.clone());
        cc.key_direction = KeyDirection::Zero;
        cc.set_protocol(Proto::Tcp);
        sc.tls_auth_key = Some(key);
        sc.key_direction = KeyDirection::One;
        sc.set_protocol(Proto::Tcp);
        let mut pair = Pair::new(cc, sc);
        pair.start();
        assert!(pair.server.data_channel_ready());

        pair.client.control_send(b"hello\0");
        pair.client.flush(true);
        let mut pkt = pair.client.host_mut().out.pop_front().unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0x01;
        deliver(&mut pair.server, &pkt);
        assert_eq!(pair.server.stats().count(Error::Hmac), 1);
        assert!(pair.server.invalidated());
        assert_eq!(pair.server.invalidation_reason(), Some(Error::Hmac));
    }

    #[test]
    fn soft_rekey_at_renegotiate_time() {
        let mut opts = base_opts();
        opts.push("cipher", &["AES-128-GCM"]);
        opts.push("reneg-sec", &["60"]);
        let mut pair = Pair::with_opts(&opts);
        pair.start();
        assert_eq!(pair.client.primary_key_id(), Some(0));

        // Client renegotiates at 60s (the server staggers to 120s).
        pair.run_for(Duration::from_secs(62));
        assert_eq!(pair.client.secondary_key_id(), Some(1));
        assert_eq!(pair.server.secondary_key_id(), Some(1));

        // become-primary = min(hand-window, reneg/2) = 30s after ACTIVE.
        pair.run_for(Duration::from_secs(35));
        assert_eq!(pair.client.primary_key_id(), Some(1));
        assert_eq!(pair.server.primary_key_id(), Some(1));

        // Data keeps flowing on the promoted key.
        let payload = b"mid-rekey traffic".to_vec();
        assert_eq!(pair.send_data(true, &payload).unwrap(), payload);
        assert_eq!(pair.send_data(false, &payload).unwrap(), payload);
        assert!(!pair.client.invalidated());
        assert!(!pair.server.invalidated());
    }

    #[test]
    fn manual_renegotiate_key_ids_wrap_to_one() {
        let mut pair = handshaken_pair();
        for expected in [1u8, 2, 3, 4, 5, 6, 7, 1, 2] {
            pair.client.renegotiate();
            assert_eq!(pair.client.secondary_key_id(), Some(expected));
        }
    }

    #[test]
    fn keepalive_ping_is_sent_and_swallowed() {
        let mut pair = handshaken_pair();
        // keepalive_ping is 8s; run past it and the marker must have been
        // exchanged without surfacing as tunnel data.
        pair.run_for(Duration::from_secs(10));
        assert!(pair.client.host().data_in.is_empty());
        assert!(pair.server.host().data_in.is_empty());
        assert!(!pair.client.invalidated());
    }

    #[test]
    fn keepalive_timeout_disconnects() {
        let mut pair = handshaken_pair();
        pair.run_for(Duration::from_secs(2));
        // Dead link: pings go nowhere, nothing arrives.
        pair.drop_all = true;
        pair.run_for(Duration::from_secs(45));
        assert!(pair.client.invalidated());
        assert_eq!(
            pair.client.invalidation_reason(),
            Some(Error::KeepaliveTimeout)
        );
        assert!(pair.client.stats().count(Error::KeepaliveTimeout) >= 1);
        assert!(pair.server.invalidated());
    }

    #[test]
    fn handshake_timeout_is_fatal_on_first_key() {
        let mut opts = base_opts();
        opts.push("hand-window", &["30"]);
        let mut pair = Pair::with_opts(&opts);
        pair.drop_all = true;
        pair.start();
        pair.run_for(Duration::from_secs(35));
        assert!(pair.client.invalidated());
        assert!(pair.client.stats().count(Error::HandshakeTimeout) >= 1);
    }

    #[test]
    fn explicit_exit_notify_reaches_the_peer() {
        let mut pair = handshaken_pair();
        pair.client.send_explicit_exit_notify();
        let pkt = pair.client.host_mut().out.pop_front().unwrap();
        deliver(&mut pair.server, &pkt);
        assert_eq!(
            pair.server.host().data_in.last().unwrap().as_slice(),
            &EXPLICIT_EXIT_NOTIFY_MESSAGE[..]
        );

        // Servers stay quiet on disconnect.
        pair.server.send_explicit_exit_notify();
        assert!(pair.server.host().out.is_empty());
    }

    #[test]
    fn server_push_switches_cipher_and_enables_op32() {
        let (mut cc, mut sc) = config_pair(&base_opts());
        // Real AEAD on both ends; the client defers its data channel until
        // the push settles the cipher.
        cc.dc_factory = Arc::new(RingDcFactory);
        cc.dc_deferred = true;
        sc.dc_factory = Arc::new(RingDcFactory);
        sc.dc.cipher = Cipher::Aes256Gcm;
        sc.dc.digest = Digest::None;
        let mut pair = Pair::new(cc, sc);
        pair.start();
        assert!(pair.client.data_channel_ready());
        // No crypto instance yet: encrypt yields an empty buffer.
        assert!(pair.send_data(true, b"too early").is_none());

        pair.client.control_send(b"PUSH_REQUEST\0");
        pair.client.flush(true);
        pair.pump();
        pair.server
            .control_send(b"PUSH_REPLY,cipher AES-256-GCM,auth none,peer-id 5\0");
        pair.server.flush(true);
        pair.pump();

        let reply = pair.client.host_mut().app_in.pop().unwrap();
        let reply = String::from_utf8_lossy(&reply[..reply.len() - 1]).into_owned();
        let opts = OptionList::parse_csv(&reply);
        pair.client.process_push(&opts).unwrap();
        pair.client.init_data_channel();
        assert_eq!(pair.client.config().dc.cipher, Cipher::Aes256Gcm);

        // Client now sends DATA_V2 frames carrying its peer id.
        let payload = b"over aes-256-gcm".to_vec();
        let mut buf = pair.client.config().frame.prepare_with(&payload);
        pair.client.data_encrypt(&mut buf);
        let wire = buf.as_slice().to_vec();
        assert_eq!(opcode_extract(wire[0]), DATA_V2);
        let t = pair.server.packet_type(&wire);
        assert_eq!(t.peer_id(), Some(5));
        let mut rbuf = Buffer::from_slice(&wire);
        assert!(pair.server.data_decrypt(&t, &mut rbuf));
        assert_eq!(rbuf.as_slice(), payload.as_slice());

        // Server to client still uses the 1-byte DATA_V1 head.
        assert_eq!(pair.send_data(false, &payload).unwrap(), payload);
        assert_eq!(pair.client.stats().count(Error::KeyLimitReneg), 0);
    }

    #[test]
    fn data_limit_drives_rekey_and_pending_promotion() {
        // Keepalive quiet, so the only packet that can confirm the pending
        // key is the explicit one below.
        let mut opts = base_opts();
        opts.push("keepalive", &["3600", "7200"]);
        let mut pair = Pair::with_opts(&opts);
        pair.start();
        // Get past the initial key's become-primary point, so the limit
        // crossing schedules a renegotiation instead of queueing one.
        pair.run_for(Duration::from_secs(7));

        // Burn through the 64-bit block cipher byte budget on encrypt only
        // (the peer never sees these, so only the client trips the limit).
        let chunk = vec![0u8; 48_000];
        for _ in 0..1001 {
            let mut buf = pair.client.config().frame.prepare_with(&chunk);
            pair.client.data_encrypt(&mut buf);
            assert!(!buf.is_empty());
        }
        assert!(pair.client.stats().count(Error::KeyLimitReneg) >= 1);

        // The renegotiation is scheduled within a second on the client.
        pair.run_for(Duration::from_secs(3));
        assert_eq!(pair.client.secondary_key_id(), Some(1));
        assert!(pair.server.secondary_key_id().is_some());

        // bs64 become-primary is 5s. The server promotes on schedule; the
        // client holds the new key in PRIMARY_PENDING until the server
        // proves it can send on it.
        pair.run_for(Duration::from_secs(7));
        assert_eq!(pair.server.primary_key_id(), Some(1));
        assert_eq!(pair.client.primary_key_id(), Some(0));

        let payload = b"confirming packet".to_vec();
        assert_eq!(pair.send_data(false, &payload).unwrap(), payload);
        pair.run_for(Duration::from_secs(2));
        assert_eq!(pair.client.primary_key_id(), Some(1));

        // Traffic continues on the promoted key without interruption.
        assert_eq!(pair.send_data(true, &payload).unwrap(), payload);
    }

    #[test]
    fn dump_packet_renders_control_heads() {
        let mut pair = Pair::with_opts(&base_opts());
        pair.client.start();
        pair.client.flush(true);
        let pkt = pair.client.host().out.front().unwrap().clone();
        let dump = pair.client.dump_packet(&pkt);
        assert!(dump.starts_with("CONTROL_HARD_RESET_CLIENT_V2/0"), "{}", dump);
        assert!(dump.contains("SRC_PSID="));
        assert!(dump.contains("MSG_ID=0"));
        assert_eq!(pair.client.dump_packet(&[0xFF, 1, 2]), "BAD_PACKET");
    }
}
