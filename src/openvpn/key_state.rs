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

//! One key context: a single TLS session plus the control channel
//! reliability layer, the key-method 2 auth exchange, the derived data
//! channel instance, and the scheduled events that drive the dual-key
//! lifecycle.

use std::collections::VecDeque;

use crate::buffer::{BufResult, Buffer, Frame};
use crate::openvpn::data_channel::{
    DataLimit, DcInstance, DlMode, DlState, BS64_DATA_LIMIT,
};
use crate::openvpn::error::Error;
use crate::openvpn::packet::{
    op32_compose, op_compose, op_head_size, Packet, ACK_V1, CONTROL_HARD_RESET_CLIENT_V2,
    CONTROL_HARD_RESET_SERVER_V2, CONTROL_SOFT_RESET_V1, CONTROL_V1, OP_SIZE_V2,
};
use crate::openvpn::packet_id::PacketId;
use crate::openvpn::psid::Psid;
use crate::openvpn::reliable::{AckList, ReliableRecv, ReliableSend, TransmitPayload};
use crate::openvpn::session::{ProtoHost, SessionShared};
use crate::openvpn::tls::TlsSession;
use crate::openvpn::tls_auth::{OpenVPNStaticKey, INVERSE, NORMAL};
use crate::openvpn::tlsprf::TlsPrf;
use crate::openvpn::compress::CompressContext;
use crate::openvpn::{AUTH_PREFIX, APP_MSG_MAX, EXPLICIT_EXIT_NOTIFY_MESSAGE, KEEPALIVE_MESSAGE};
use crate::time::{Duration, Time};

/// Negotiation states. `C_*` on the client, `S_*` on the server; the two
/// trajectories are the same modulo naming. `*Ack` states advance once the
/// reliable send queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    CInitial,
    CWaitReset,
    CWaitResetAck,
    CWaitAuth,
    CWaitAuthAck,
    SInitial,
    SWaitReset,
    SWaitResetAck,
    SWaitAuth,
    SWaitAuthAck,
    Active,
}

impl State {
    fn is_ack_state(self) -> bool {
        matches!(
            self,
            State::CWaitResetAck | State::CWaitAuthAck | State::SWaitResetAck | State::SWaitAuthAck
        )
    }
}

/// Scheduled events of a key context; each context has at most one pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    None,
    /// Handshake finished; fired once on reaching [`State::Active`].
    Active,
    /// Handshake deadline watchdog. Fatal on the first primary; triggers a
    /// new negotiation cycle on a secondary.
    Negotiate,
    /// Scheduled promotion of a secondary to primary.
    BecomePrimary,
    /// Waiting for the first peer packet before arming `BecomePrimary`
    /// (data-limited client keys).
    PrimaryPending,
    /// Start a soft renegotiation (honored on the primary).
    Renegotiate,
    /// Renegotiation that fires from either slot.
    RenegotiateForce,
    /// Rekey request raised on a secondary, queued to take effect once the
    /// key becomes primary.
    RenegotiateQueue,
    /// End of the key's life.
    Expire,
}

pub struct KeyContext {
    key_id: u8,
    state: State,
    invalidated: bool,
    invalidation_reason: Option<Error>,
    dirty: bool,
    key_limit_renegotiation_fired: bool,
    is_reliable: bool,
    enable_op32: bool,
    remote_peer_id: Option<u32>,
    max_ack_list: usize,
    frame: Frame,

    construct_time: Time,
    reached_active_time: Time,
    current_event: Event,
    next_event: Event,
    next_event_time: Time,

    rel_send: ReliableSend,
    rel_recv: ReliableRecv,
    xmit_acks: AckList,

    tls: Box<dyn TlsSession>,
    tlsprf: TlsPrf,

    crypto: Option<Box<dyn DcInstance>>,
    data_channel_key: Option<OpenVPNStaticKey>,
    data_limit: Option<DataLimit>,
    compress: Option<CompressContext>,

    app_pre_write_queue: VecDeque<Buffer>,
    app_recv_buf: Vec<u8>,
}

impl KeyContext {
    /// `initiator` is the side that sends the first reset: the client on the
    /// initial key, the renegotiating side on soft resets.
    pub fn new(sh: &mut SessionShared, initiator: bool) -> KeyContext {
        let key_id = sh.next_key_id();
        let state = match (sh.is_server(), initiator) {
            (false, true) => State::CInitial,
            (false, false) => State::CWaitReset,
            (true, true) => State::SInitial,
            (true, false) => State::SWaitReset,
        };
        let c = &sh.config;
        let mut kc = KeyContext {
            key_id,
            state,
            invalidated: false,
            invalidation_reason: None,
            dirty: false,
            key_limit_renegotiation_fired: false,
            is_reliable: c.proto.is_reliable(),
            enable_op32: c.enable_op32,
            remote_peer_id: c.remote_peer_id,
            max_ack_list: c.max_ack_list,
            frame: c.frame,
            construct_time: sh.now,
            reached_active_time: Time::ZERO,
            current_event: Event::None,
            next_event: Event::None,
            next_event_time: Time::INFINITE,
            rel_send: ReliableSend::new(c.reliable_window, c.tls_timeout),
            rel_recv: ReliableRecv::new(c.reliable_window),
            xmit_acks: AckList::new(),
            tls: c.tls_factory.new_session(sh.mode),
            tlsprf: TlsPrf::new(sh.is_server()),
            crypto: None,
            data_channel_key: None,
            data_limit: None,
            compress: None,
            app_pre_write_queue: VecDeque::new(),
            app_recv_buf: Vec::new(),
        };
        // Negotiation must complete within the handshake window.
        let deadline = sh.now + sh.config.handshake_window;
        kc.set_event(Event::None, Event::Negotiate, deadline);
        kc
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn invalidation_reason(&self) -> Option<Error> {
        self.invalidation_reason
    }

    pub fn invalidate(&mut self, reason: Error) {
        if !self.invalidated {
            log::debug!("key[{}]: invalidated: {}", self.key_id, reason);
            self.invalidated = true;
            self.invalidation_reason = Some(reason);
            self.reached_active_time = Time::ZERO;
            self.next_event = Event::None;
            self.next_event_time = Time::INFINITE;
        }
    }

    /// Data channel is keyed and ready.
    pub fn data_channel_ready(&self) -> bool {
        self.state == State::Active
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reached_active(&self) -> Time {
        self.reached_active_time
    }

    // ---- events ----------------------------------------------------------

    fn set_event(&mut self, current: Event, next: Event, next_time: Time) {
        log::trace!(
            "key[{}]: event {:?} -> {:?} at {:?}",
            self.key_id,
            current,
            next,
            next_time
        );
        self.current_event = current;
        self.next_event = next;
        self.next_event_time = next_time;
    }

    fn set_current_event(&mut self, current: Event) {
        log::trace!("key[{}]: event {:?}", self.key_id, current);
        self.current_event = current;
    }

    /// Is an event ready for the protocol context to process?
    pub fn event_pending(&mut self, sh: &mut SessionShared) -> bool {
        if self.current_event == Event::None && sh.now >= self.next_event_time {
            self.process_next_event(sh);
        }
        self.current_event != Event::None
    }

    /// Fetch and clear the pending event.
    pub fn take_event(&mut self) -> Event {
        std::mem::replace(&mut self.current_event, Event::None)
    }

    /// Schedule expiration, which is the default next event after the
    /// lifecycle ones have fired.
    pub fn prepare_expire(&mut self, sh: &SessionShared, current: Event) {
        let at = if self.key_limit_renegotiation_fired {
            self.data_limit_expire(sh)
        } else {
            self.construct_time + sh.config.expire
        };
        self.set_event(current, Event::Expire, at);
    }

    pub fn set_next_event_if_unspecified(&mut self, sh: &SessionShared) {
        if self.next_event == Event::None && !self.invalidated {
            self.prepare_expire(sh, Event::None);
        }
    }

    /// Schedule a data-flow driven renegotiation event shortly after `t`.
    pub fn key_limit_reneg(&mut self, sh: &SessionShared, ev: Event, t: Time) {
        if !t.is_infinite() {
            let pad = Duration::from_secs(if sh.is_server() { 2 } else { 1 });
            self.set_event(Event::None, ev, t + pad);
        }
    }

    /// Time of the scheduled promotion, if one is pending.
    pub fn become_primary_time(&self) -> Time {
        if self.next_event == Event::BecomePrimary {
            self.next_event_time
        } else {
            Time::INFINITE
        }
    }

    fn process_next_event(&mut self, sh: &mut SessionShared) {
        if sh.now < self.next_event_time {
            return;
        }
        match self.next_event {
            Event::BecomePrimary => {
                if self.data_limit_defer(sh) {
                    // Hold the promotion until the peer proves it can reach
                    // us on this key.
                    let deadline = self.data_limit_expire(sh);
                    self.set_event(Event::None, Event::PrimaryPending, deadline);
                } else {
                    let reneg = self.construct_time + sh.config.renegotiate;
                    self.set_event(Event::BecomePrimary, Event::Renegotiate, reneg);
                }
            }
            ev @ (Event::Renegotiate | Event::RenegotiateForce) => {
                self.prepare_expire(sh, ev);
            }
            Event::Negotiate => self.kev_error(sh, Event::Negotiate, Error::KevNegotiate),
            Event::PrimaryPending => self.kev_error(sh, Event::PrimaryPending, Error::KevPending),
            Event::Expire => self.kev_error(sh, Event::Expire, Error::KevExpire),
            _ => {}
        }
    }

    fn kev_error(&mut self, sh: &mut SessionShared, ev: Event, reason: Error) {
        sh.stats.error(reason);
        self.invalidate(reason);
        self.set_current_event(ev);
    }

    // ---- lifecycle -------------------------------------------------------

    /// Send the initial reset. Only meaningful on the initiator side.
    pub fn start(&mut self, sh: &mut SessionShared) {
        match self.state {
            State::CInitial => {
                self.send_reset(sh);
                self.state = State::CWaitReset;
                self.dirty = true;
            }
            State::SInitial => {
                self.send_reset(sh);
                self.state = State::SWaitReset;
                self.dirty = true;
            }
            _ => {}
        }
    }

    fn initial_op(&self, sh: &SessionShared, sender: bool) -> u8 {
        if self.key_id != 0 {
            CONTROL_SOFT_RESET_V1
        } else if sh.is_server() == sender {
            CONTROL_HARD_RESET_SERVER_V2
        } else {
            CONTROL_HARD_RESET_CLIENT_V2
        }
    }

    fn send_reset(&mut self, sh: &mut SessionShared) {
        let pkt = Packet::new(self.initial_op(sh, true), self.frame.prepare());
        self.rel_send.send(pkt, sh.now);
    }

    fn raw_recv(&mut self, sh: &mut SessionShared, pkt: Packet) {
        if pkt.buf.is_empty() && pkt.opcode == self.initial_op(sh, false) {
            match self.state {
                State::CWaitReset => {
                    self.send_reset(sh);
                    self.state = State::CWaitResetAck;
                }
                State::SWaitReset => {
                    self.send_reset(sh);
                    self.state = State::SWaitResetAck;
                }
                _ => {}
            }
        }
    }

    fn post_ack_action<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        if !self.state.is_ack_state() || self.rel_send.n_unacked() != 0 {
            return Ok(());
        }
        match self.state {
            State::CWaitResetAck => {
                self.tls.start_handshake()?;
                self.send_auth(sh, host)?;
                self.state = State::CWaitAuth;
            }
            State::SWaitResetAck => {
                self.tls.start_handshake()?;
                self.state = State::SWaitAuth;
            }
            State::CWaitAuthAck | State::SWaitAuthAck => {
                self.active(sh)?;
                self.state = State::Active;
                log::debug!("key[{}]: ACTIVE", self.key_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn active(&mut self, sh: &mut SessionShared) -> Result<(), Error> {
        self.generate_session_keys(sh)?;
        while let Some(buf) = self.app_pre_write_queue.pop_front() {
            self.app_send_validate(&buf)?;
            self.dirty = true;
        }
        self.reached_active_time = sh.now;
        let took = sh.now - self.construct_time;
        if took > sh.slowest_handshake {
            sh.slowest_handshake = took;
        }
        let at = self.reached_active_time + sh.config.become_primary;
        self.set_event(Event::Active, Event::BecomePrimary, at);
        Ok(())
    }

    fn generate_session_keys(&mut self, sh: &mut SessionShared) -> Result<(), Error> {
        let psid_peer = sh.psid_peer.ok_or(Error::CcError)?;
        let key = self
            .tlsprf
            .generate_key_expansion(&sh.psid_self, &psid_peer)?;
        self.tlsprf.erase();
        self.data_channel_key = Some(key);
        if !sh.dc_deferred {
            self.init_data_channel(sh)?;
        }
        Ok(())
    }

    /// Build the data channel crypto from the derived key material. A no-op
    /// unless a derived key is waiting (so it is safe to call again after a
    /// server push).
    pub fn init_data_channel(&mut self, sh: &mut SessionShared) -> Result<(), Error> {
        let mut key = match self.data_channel_key.take() {
            Some(k) => k,
            None => return Ok(()),
        };
        let c = &sh.config;

        self.data_limit = if c.dc.cipher.is_bs64() {
            log::debug!(
                "key[{}]: per-key data limit {} bytes",
                self.key_id,
                BS64_DATA_LIMIT
            );
            Some(DataLimit::new(BS64_DATA_LIMIT))
        } else {
            None
        };

        let dir = if sh.is_server() { INVERSE } else { NORMAL };
        let crypto = c
            .dc_factory
            .new_instance(&c.dc, &key, dir, c.pid_mode, self.key_id)
            .map_err(|e| {
                log::warn!("key[{}]: data channel init failed: {}", self.key_id, e);
                Error::DataChannel
            })?;
        key.wipe();
        self.crypto = Some(crypto);
        self.compress = if c.comp.enabled() { Some(c.comp) } else { None };
        self.enable_op32 = c.enable_op32;
        self.remote_peer_id = c.remote_peer_id;
        Ok(())
    }

    // ---- auth message ----------------------------------------------------

    fn send_auth<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        let mut buf = self.frame.prepare();
        buf.append(&AUTH_PREFIX);
        self.tlsprf.self_randomize();
        self.tlsprf.self_write(&mut buf);
        let options = sh.config.options_string(sh.is_server());
        write_auth_string(options.as_bytes(), &mut buf)?;
        if !sh.is_server() {
            log::debug!("tunnel options: {}", options);
            if sh.config.xmit_creds {
                host.client_auth(&mut buf);
            } else {
                write_empty_string(&mut buf);
                write_empty_string(&mut buf);
            }
            let peer_info = sh.config.peer_info_string();
            write_auth_string(peer_info.as_bytes(), &mut buf)?;
        }
        self.app_send_validate(&buf)?;
        self.dirty = true;
        Ok(())
    }

    /// Number of bytes a complete auth message occupies at the front of
    /// `app_recv_buf`, if it is all there.
    fn recv_auth_len(&self) -> Option<usize> {
        let b = &self.app_recv_buf;
        let mut pos = AUTH_PREFIX.len() + self.tlsprf.peer_read_size();
        let mut skip_string = |pos: &mut usize| -> Option<()> {
            let len = b.get(*pos..*pos + 2)?;
            let len = u16::from_be_bytes([len[0], len[1]]) as usize;
            *pos += 2 + len;
            Some(())
        };
        skip_string(&mut pos)?; // options
        if self.tlsprf.is_server() {
            skip_string(&mut pos)?; // username
            skip_string(&mut pos)?; // password
            skip_string(&mut pos)?; // peer info
        }
        if pos <= b.len() {
            Some(pos)
        } else {
            None
        }
    }

    fn recv_auth<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
        msg: Vec<u8>,
    ) -> Result<(), Error> {
        let mut buf = Buffer::from_slice(&msg);
        let prefix: [u8; AUTH_PREFIX.len()] = buf.read_array().map_err(|_| Error::Buffer)?;
        if prefix != AUTH_PREFIX {
            return Err(Error::BadAuthPrefix);
        }
        self.tlsprf.peer_read(&mut buf).map_err(|_| Error::Buffer)?;
        let options = read_auth_string(&mut buf).map_err(|_| Error::Buffer)?;
        let expected = sh.config.options_string(!sh.is_server());
        if options != expected {
            log::warn!(
                "options mismatch (informational): peer '{}' local '{}'",
                options,
                expected
            );
        }
        if sh.is_server() {
            let username = read_auth_string(&mut buf).map_err(|_| Error::Buffer)?;
            let password = read_auth_string(&mut buf).map_err(|_| Error::Buffer)?;
            let peer_info = read_auth_string(&mut buf).map_err(|_| Error::Buffer)?;
            let cert = self.tls.auth_cert();
            host.server_auth(username, password, peer_info, cert);
        }
        Ok(())
    }

    /// Cleartext from the TLS layer: auth message during negotiation, app
    /// control messages afterwards.
    fn app_recv_push<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        self.app_recv_buf.extend_from_slice(&data);
        if self.app_recv_buf.len() > APP_MSG_MAX {
            return Err(Error::AppMsgTooLarge);
        }
        match self.state {
            State::CWaitAuth => {
                if let Some(n) = self.recv_auth_len() {
                    let msg: Vec<u8> = self.app_recv_buf.drain(..n).collect();
                    self.recv_auth(sh, host, msg)?;
                    self.state = State::CWaitAuthAck;
                }
            }
            State::SWaitAuth => {
                if let Some(n) = self.recv_auth_len() {
                    let msg: Vec<u8> = self.app_recv_buf.drain(..n).collect();
                    self.recv_auth(sh, host, msg)?;
                    self.send_auth(sh, host)?;
                    self.state = State::SWaitAuthAck;
                }
            }
            // The client may reach ACTIVE and start talking while our final
            // ACK to it is still in flight.
            State::SWaitAuthAck | State::Active => {
                while let Some(pos) = self.app_recv_buf.iter().position(|&b| b == 0) {
                    let msg: Vec<u8> = self.app_recv_buf.drain(..=pos).collect();
                    host.control_recv(msg);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn app_send_validate(&mut self, buf: &Buffer) -> Result<(), Error> {
        if buf.len() > APP_MSG_MAX {
            return Err(Error::AppMsgTooLarge);
        }
        self.tls.write_cleartext(buf.as_slice())
    }

    /// Queue an app-level control message. Messages sent before the
    /// handshake completes are held back until ACTIVE.
    pub fn app_send(&mut self, buf: Buffer) -> Result<(), Error> {
        if self.state == State::Active {
            self.app_send_validate(&buf)?;
            self.dirty = true;
        } else {
            self.app_pre_write_queue.push_back(buf);
        }
        Ok(())
    }

    // ---- control channel framing ----------------------------------------

    fn gen_head(&mut self, sh: &mut SessionShared, opcode: u8, buf: &mut Buffer) {
        let now_secs = sh.now.as_secs32();
        let op = op_compose(opcode, self.key_id);
        match &mut sh.ta {
            Some(ta) => {
                ta.pid_send.prepend_next(buf, now_secs);
                let n = ta.hmac.size();
                buf.prepend_alloc(n).fill(0);
                sh.psid_self.prepend(buf);
                buf.push_front(op);
                ta.hmac.sign(buf.as_mut_slice());
            }
            None => {
                sh.psid_self.prepend(buf);
                buf.push_front(op);
            }
        }
    }

    fn prepend_dest_psid_and_acks(
        &mut self,
        sh: &mut SessionShared,
        buf: &mut Buffer,
    ) -> Result<(), Error> {
        if !self.xmit_acks.is_empty() {
            match sh.psid_peer {
                Some(psid) => psid.prepend(buf),
                None => {
                    sh.stats.error(Error::CcError);
                    return Err(Error::CcError);
                }
            }
        }
        self.xmit_acks.prepend(buf, self.max_ack_list);
        Ok(())
    }

    /// Frame one reliable message for the wire.
    fn encapsulate(
        &mut self,
        sh: &mut SessionShared,
        id: u32,
        payload: &Packet,
    ) -> Result<Vec<u8>, Error> {
        let mut buf = payload.buf.clone();
        buf.prepend_u32_be(id);
        self.prepend_dest_psid_and_acks(sh, &mut buf)?;
        self.gen_head(sh, payload.opcode, &mut buf);
        Ok(buf.into_vec())
    }

    /// Frame an ACK-only packet.
    fn generate_ack(&mut self, sh: &mut SessionShared) -> Result<Vec<u8>, Error> {
        let mut buf = self.frame.prepare();
        self.prepend_dest_psid_and_acks(sh, &mut buf)?;
        self.gen_head(sh, ACK_V1, &mut buf);
        Ok(buf.into_vec())
    }

    fn verify_src_psid(&mut self, sh: &mut SessionShared, src: Psid) -> bool {
        match sh.psid_peer {
            Some(peer) => {
                if peer != src {
                    sh.stats.error(Error::CcError);
                    if sh.is_tcp() {
                        self.invalidate(Error::CcError);
                    }
                    return false;
                }
                true
            }
            None => {
                // First authenticated packet defines the peer for the rest
                // of the session.
                sh.psid_peer = Some(src);
                true
            }
        }
    }

    fn verify_dest_psid(&mut self, sh: &mut SessionShared, buf: &mut Buffer) -> BufResult<bool> {
        let dest = Psid::read(buf)?;
        if dest != sh.psid_self {
            sh.stats.error(Error::CcError);
            if sh.is_tcp() {
                self.invalidate(Error::CcError);
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// The incoming control pipeline: HMAC, PSIDs, replay, ACKs,
    /// sequencing. Returns whether a control message was accepted into the
    /// receive window.
    fn decapsulate(&mut self, sh: &mut SessionShared, pkt: Packet) -> BufResult<bool> {
        let opcode = pkt.opcode;
        let mut buf = pkt.buf;

        if sh.ta.is_some() {
            {
                let ta = sh.ta.as_ref().unwrap();
                if !ta.hmac.check(buf.as_slice()) {
                    sh.stats.error(Error::Hmac);
                    if sh.is_tcp() {
                        self.invalidate(Error::Hmac);
                    }
                    return Ok(false);
                }
            }
            sh.update_last_received();

            buf.advance(1)?;
            let src_psid = Psid::read(&mut buf)?;
            let hmac_size = sh.ta.as_ref().unwrap().hmac.size();
            buf.advance(hmac_size)?;
            let pid = PacketId::read_long(&mut buf)?;

            if !self.verify_src_psid(sh, src_psid) {
                return Ok(false);
            }
            let pid_ok = sh.ta.as_ref().unwrap().pid_recv.test(pid);

            // Read the ACK list regardless, but only retire send entries on
            // a non-replayed packet.
            let acks = AckList::read(&mut buf)?;
            if pid_ok {
                for id in &acks {
                    self.rel_send.ack(*id);
                }
            }
            if !acks.is_empty() && !self.verify_dest_psid(sh, &mut buf)? {
                return Ok(false);
            }

            if opcode != ACK_V1 {
                let id = buf.read_u32_be()?;
                if pid_ok {
                    let flags = self.rel_recv.receive(Packet::new(opcode, buf), id);
                    if flags.ack_to_sender {
                        self.xmit_acks.push(id);
                    }
                    if flags.in_window {
                        sh.ta.as_mut().unwrap().pid_recv.add(pid);
                        return Ok(true);
                    }
                } else {
                    sh.stats.error(Error::Replay);
                    // Even replayed packets must be ACKed, or the peer
                    // retransmits forever.
                    if pid.is_valid() {
                        self.xmit_acks.push(id);
                    }
                }
            } else if pid_ok {
                sh.ta.as_mut().unwrap().pid_recv.add(pid);
            } else {
                sh.stats.error(Error::Replay);
            }
            Ok(false)
        } else {
            sh.update_last_received();
            buf.advance(1)?;
            let src_psid = Psid::read(&mut buf)?;
            if !self.verify_src_psid(sh, src_psid) {
                return Ok(false);
            }
            let acks = AckList::read(&mut buf)?;
            for id in &acks {
                self.rel_send.ack(*id);
            }
            if !acks.is_empty() && !self.verify_dest_psid(sh, &mut buf)? {
                return Ok(false);
            }
            if opcode != ACK_V1 {
                let id = buf.read_u32_be()?;
                let flags = self.rel_recv.receive(Packet::new(opcode, buf), id);
                if flags.ack_to_sender {
                    self.xmit_acks.push(id);
                }
                if flags.in_window {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    /// Integrity pre-check of a control packet without touching any state.
    /// Used before creating a secondary for a peer soft reset.
    pub fn validate(buf: &[u8], sh: &SessionShared) -> bool {
        fn inner(data: &[u8], sh: &SessionShared) -> BufResult<bool> {
            let mut buf = Buffer::from_slice(data);
            match &sh.ta {
                Some(ta) => {
                    if !ta.hmac.check(data) {
                        return Ok(false);
                    }
                    buf.advance(1)?;
                    let src = Psid::read(&mut buf)?;
                    if sh.psid_peer != Some(src) {
                        return Ok(false);
                    }
                    buf.advance(ta.hmac.size())?;
                    let pid = PacketId::read_long(&mut buf)?;
                    if AckList::skip(&mut buf)? {
                        let dest = Psid::read(&mut buf)?;
                        if dest != sh.psid_self {
                            return Ok(false);
                        }
                    }
                    Ok(ta.pid_recv.test(pid))
                }
                None => {
                    buf.advance(1)?;
                    let src = Psid::read(&mut buf)?;
                    if sh.psid_peer != Some(src) {
                        return Ok(false);
                    }
                    if AckList::skip(&mut buf)? {
                        let dest = Psid::read(&mut buf)?;
                        if dest != sh.psid_self {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            }
        }
        inner(buf, sh).unwrap_or(false)
    }

    // ---- net receive / send pumps ---------------------------------------

    /// Feed one classified control channel packet.
    pub fn net_recv<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
        pkt: Packet,
    ) -> Result<bool, Error> {
        if self.invalidated {
            return Ok(false);
        }
        let accepted = match self.decapsulate(sh, pkt) {
            Ok(a) => a,
            Err(_) => {
                sh.stats.error(Error::Buffer);
                if sh.is_tcp() {
                    self.invalidate(Error::Buffer);
                }
                false
            }
        };
        self.process_sequenced(sh, host)?;
        self.dirty = true;
        Ok(accepted)
    }

    /// Deliver reordered messages to the TLS layer and pump its output.
    fn process_sequenced<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        while let Some(msg) = self.rel_recv.next_sequenced() {
            if msg.is_raw() {
                self.raw_recv(sh, msg);
            } else {
                self.tls.write_ciphertext(msg.buf.as_slice())?;
            }
        }
        while let Some(clear) = self.tls.read_cleartext()? {
            self.app_recv_push(sh, host, clear)?;
        }
        self.ssl_down_stack(sh);
        Ok(())
    }

    /// Move pending TLS ciphertext into the reliable send queue.
    fn ssl_down_stack(&mut self, sh: &SessionShared) {
        while self.rel_send.ready() {
            match self.tls.read_ciphertext() {
                Some(chunk) => {
                    let pkt = Packet::new(CONTROL_V1, self.frame.prepare_with(&chunk));
                    self.rel_send.send(pkt, sh.now);
                }
                None => break,
            }
        }
    }

    /// Transmit every due reliable message. First transmissions are framed
    /// here (capturing the current ACK list); retransmissions resend the
    /// captured bytes, and are suppressed on reliable transports.
    fn service_send<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        self.ssl_down_stack(sh);
        enum Action {
            Frame(Packet),
            Send(Vec<u8>),
            Skip,
        }
        for id in self.rel_send.due(sh.now) {
            let action = match self.rel_send.transmit(id, sh.now) {
                Some((TransmitPayload::Fresh(p), _)) => Action::Frame(p.clone()),
                Some((TransmitPayload::Framed(b), retx)) => {
                    if retx && self.is_reliable {
                        Action::Skip
                    } else {
                        Action::Send(b.clone())
                    }
                }
                None => Action::Skip,
            };
            match action {
                Action::Frame(p) => {
                    let framed = self.encapsulate(sh, id, &p)?;
                    host.control_net_send(&framed);
                    self.rel_send.set_framed(id, framed);
                }
                Action::Send(b) => host.control_net_send(&b),
                Action::Skip => {}
            }
        }
        Ok(())
    }

    fn send_pending_acks<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        while !self.xmit_acks.is_empty() {
            let framed = self.generate_ack(sh)?;
            host.control_net_send(&framed);
        }
        Ok(())
    }

    /// Drain pending state changes to the network.
    pub fn flush<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        if !self.dirty || self.invalidated {
            return Ok(());
        }
        self.post_ack_action(sh, host)?;
        self.service_send(sh, host)?;
        self.send_pending_acks(sh, host)?;
        self.dirty = false;
        Ok(())
    }

    /// Reliability layer timer tick.
    pub fn retransmit<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) -> Result<(), Error> {
        if self.invalidated {
            return Ok(());
        }
        self.service_send(sh, host)
    }

    /// When should `retransmit` next run for this key context?
    pub fn next_retransmit(&self) -> Time {
        self.rel_send.next_retransmit().min(self.next_event_time)
    }

    // ---- data channel ----------------------------------------------------

    fn do_encrypt(&mut self, sh: &mut SessionShared, buf: &mut Buffer) -> Result<(), Error> {
        if let Some(comp) = &self.compress {
            comp.compress(buf);
        }
        if self.data_limit.is_some() {
            self.data_limit_add(sh, DlMode::Encrypt, buf.len());
        }
        let crypto = self.crypto.as_mut().ok_or(Error::DataChannel)?;
        let wrap = if self.enable_op32 {
            let op32 = op32_compose(crate::openvpn::packet::DATA_V2, self.key_id, self.remote_peer_id);
            let head = op32.to_be_bytes();
            let wrap = crypto.encrypt(buf, &head)?;
            buf.prepend(&head);
            wrap
        } else {
            let head = [op_compose(crate::openvpn::packet::DATA_V1, self.key_id)];
            let wrap = crypto.encrypt(buf, &head)?;
            buf.push_front(head[0]);
            wrap
        };
        if wrap {
            // The 32-bit send counter is nearing wraparound; force a rekey
            // before the replay window misreads restarted counters.
            self.schedule_key_limit_renegotiation(sh);
        }
        Ok(())
    }

    /// Encrypt and frame one data packet in place. With no crypto instance
    /// the buffer is cleared and the caller must drop it.
    pub fn encrypt(&mut self, sh: &mut SessionShared, buf: &mut Buffer) -> Result<(), Error> {
        if self.state == State::Active && self.crypto.is_some() && !self.invalidated {
            self.do_encrypt(sh, buf)
        } else {
            buf.clear();
            Ok(())
        }
    }

    /// Decrypt one data packet in place. Failures are counted and clear the
    /// buffer; on stream transports, decrypt failures invalidate the
    /// context.
    pub fn decrypt(&mut self, sh: &mut SessionShared, buf: &mut Buffer) {
        if self.state != State::Active || self.crypto.is_none() || self.invalidated {
            buf.clear();
            return;
        }
        let result = (|| -> Result<(), Error> {
            let head_op = *buf.as_slice().first().ok_or(Error::Buffer)?;
            let head_size = op_head_size(head_op);
            let mut head = [0u8; OP_SIZE_V2];
            head[..head_size].copy_from_slice(&buf.as_slice()[..head_size]);
            buf.advance(head_size).map_err(|_| Error::Buffer)?;
            self.crypto
                .as_mut()
                .unwrap()
                .decrypt(buf, &head[..head_size])?;
            if self.data_limit.is_some() {
                self.data_limit_add(sh, DlMode::Decrypt, buf.len());
            }
            if let Some(comp) = &self.compress {
                comp.decompress(buf)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            sh.stats.error(e);
            if sh.is_tcp() && matches!(e, Error::Decrypt | Error::Hmac | Error::Buffer) {
                self.invalidate(e);
            }
            buf.clear();
        }
    }

    /// Send a constant message through the data channel.
    fn send_data_channel_message<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
        data: &[u8],
    ) {
        if self.state != State::Active || self.crypto.is_none() || self.invalidated {
            return;
        }
        let mut buf = self.frame.prepare_with(data);
        match self.do_encrypt(sh, &mut buf) {
            Ok(()) => host.control_net_send(buf.as_slice()),
            Err(e) => sh.stats.error(e),
        }
    }

    pub fn send_keepalive<H: ProtoHost>(&mut self, sh: &mut SessionShared, host: &mut H) {
        log::trace!("key[{}]: send keepalive", self.key_id);
        self.send_data_channel_message(sh, host, &KEEPALIVE_MESSAGE);
    }

    pub fn send_explicit_exit_notify<H: ProtoHost>(
        &mut self,
        sh: &mut SessionShared,
        host: &mut H,
    ) {
        log::debug!("key[{}]: send explicit exit notify", self.key_id);
        self.send_data_channel_message(sh, host, &EXPLICIT_EXIT_NOTIFY_MESSAGE);
    }

    // ---- data limit / key limit rekey ------------------------------------

    fn schedule_key_limit_renegotiation(&mut self, sh: &mut SessionShared) {
        if self.key_limit_renegotiation_fired || self.state != State::Active || self.invalidated {
            return;
        }
        log::debug!("key[{}]: schedule key limit renegotiation", self.key_id);
        self.key_limit_renegotiation_fired = true;
        sh.stats.error(Error::KeyLimitReneg);
        if self.next_event == Event::BecomePrimary {
            // Still a secondary: queue the request to cross over to the
            // primary without disturbing the pending promotion.
            self.set_current_event(Event::RenegotiateQueue);
        } else {
            let now = sh.now;
            self.key_limit_reneg(sh, Event::Renegotiate, now);
        }
    }

    fn data_limit_add(&mut self, sh: &mut SessionShared, mode: DlMode, bytes: usize) {
        let state = match &mut self.data_limit {
            Some(dl) => dl.add(mode, bytes),
            None => return,
        };
        if state > DlState::None {
            self.data_limit_event(sh, mode, state);
        }
    }

    /// External notification that a data limit level has been observed.
    pub fn data_limit_notify(&mut self, sh: &mut SessionShared, mode: DlMode, level: DlState) {
        let state = match &mut self.data_limit {
            Some(dl) => dl.update_state(mode, level),
            None => return,
        };
        if state > DlState::None {
            self.data_limit_event(sh, mode, state);
        }
    }

    fn data_limit_event(&mut self, sh: &mut SessionShared, mode: DlMode, state: DlState) {
        log::debug!(
            "key[{}]: data limit {:?} {:?}",
            self.key_id,
            mode,
            state
        );
        if state == DlState::Red {
            self.schedule_key_limit_renegotiation(sh);
        }
        // A pending key may only be promoted once the peer has proven it
        // can send to us under it.
        if self.next_event == Event::PrimaryPending
            && self.data_limit.map_or(false, |dl| dl.is_decrypt_green())
        {
            let at = sh.now + Duration::from_secs(1);
            self.set_event(Event::None, Event::BecomePrimary, at);
        }
    }

    fn data_limit_defer(&self, sh: &SessionShared) -> bool {
        !sh.is_server()
            && self.key_id != 0
            && self
                .data_limit
                .map_or(false, |dl| !dl.is_decrypt_green())
    }

    fn data_limit_expire(&self, sh: &SessionShared) -> Time {
        sh.now + sh.config.handshake_window * 2
    }
}

// Auth strings are u16-big-endian length prefixed and null terminated; the
// length includes the terminator. An empty string is a bare zero length.

pub fn write_auth_string(s: &[u8], buf: &mut Buffer) -> Result<(), Error> {
    if s.is_empty() {
        write_empty_string(buf);
        return Ok(());
    }
    let len = s.len() + 1;
    if len > 0xFFFF {
        return Err(Error::AppMsgTooLarge);
    }
    buf.append_u16_be(len as u16);
    buf.append(s);
    buf.append_u8(0);
    Ok(())
}

pub fn write_empty_string(buf: &mut Buffer) {
    buf.append_u16_be(0);
}

pub fn read_auth_string(buf: &mut Buffer) -> BufResult<String> {
    let len = buf.read_u16_be()? as usize;
    if len == 0 {
        return Ok(String::new());
    }
    let data = buf.read_slice(len)?;
    Ok(String::from_utf8_lossy(&data[..len - 1]).into_owned())
}
