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

//! Engine configuration: loading local options, consuming server-pushed
//! options, and the strings exchanged with the peer (options consistency
//! check and client peer-info). The configuration file *language* is out of
//! scope; an [`OptionList`] is already-parsed options.

use std::sync::Arc;

use crate::buffer::Frame;
use crate::crypto::{Cipher, Digest};
use crate::openvpn::compress::{CompressContext, CompressMethod};
use crate::openvpn::data_channel::{DcFactory, DcSettings, RingDcFactory};
use crate::openvpn::error::OptionError;
use crate::openvpn::packet_id::{PacketId, PidMode};
use crate::openvpn::tls::TlsFactory;
use crate::openvpn::tls_auth::{KeyDirection, OpenVPNStaticKey};
use crate::time::{Duration, DUR_INFINITE};

/// A set of already-parsed options: name plus argument list, in insertion
/// order. Lookups return the first match.
#[derive(Debug, Clone, Default)]
pub struct OptionList {
    options: Vec<(String, Vec<String>)>,
}

impl OptionList {
    pub fn new() -> OptionList {
        OptionList::default()
    }

    pub fn push(&mut self, name: &str, args: &[&str]) -> &mut Self {
        self.options
            .push((name.into(), args.iter().map(|s| (*s).into()).collect()));
        self
    }

    /// Parse a comma-separated option string of the form the server pushes:
    /// `"cipher AES-256-GCM,peer-id 5,ping 10"`. A leading `PUSH_REPLY`
    /// element is skipped.
    pub fn parse_csv(s: &str) -> OptionList {
        let mut list = OptionList::new();
        for item in s.split(',') {
            let mut words = item.split_whitespace();
            let name = match words.next() {
                Some(n) if n != "PUSH_REPLY" => n.to_string(),
                _ => continue,
            };
            let args: Vec<String> = words.map(|w| w.to_string()).collect();
            list.options.push((name, args));
        }
        list
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, args)| args.as_slice())
    }

    pub fn get_arg(&self, name: &str, idx: usize) -> Option<&str> {
        self.get(name).and_then(|args| args.get(idx)).map(|s| s.as_str())
    }
}

/// Transport the session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl Proto {
    pub fn is_udp(self) -> bool {
        self == Proto::Udp
    }

    pub fn is_tcp(self) -> bool {
        self == Proto::Tcp
    }

    /// Does the transport deliver reliably (suppressing retransmits)?
    pub fn is_reliable(self) -> bool {
        self.is_tcp()
    }

    /// Extra per-packet transport framing (TCP length prefix).
    pub fn extra_transport_bytes(self) -> usize {
        if self.is_tcp() {
            2
        } else {
            0
        }
    }

    /// Client-form protocol name; both sides emit the client form so the
    /// options consistency strings match.
    pub fn str_client(self) -> &'static str {
        match self {
            Proto::Udp => "UDPv4",
            Proto::Tcp => "TCPv4_CLIENT",
        }
    }
}

/// OSI layer of the tunneled traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// tun device, IP packets.
    L3,
    /// tap device, ethernet frames.
    L2,
}

impl Layer {
    pub fn dev_type(self) -> &'static str {
        match self {
            Layer::L3 => "tun",
            Layer::L2 => "tap",
        }
    }
}

fn platform_name() -> &'static str {
    if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else if cfg!(windows) {
        "win"
    } else {
        "unix"
    }
}

/// Configuration for a protocol context. Shared by value between reset
/// cycles; the factories are shared handles.
#[derive(Clone)]
pub struct Config {
    pub tls_factory: Arc<dyn TlsFactory>,
    pub dc_factory: Arc<dyn DcFactory>,
    /// Data channel algorithms.
    pub dc: DcSettings,
    pub frame: Frame,
    /// Defer data channel initialization until after the client options
    /// pull.
    pub dc_deferred: bool,
    /// Transmit username/password to the server (client only). When false,
    /// empty strings are sent; the fields are never omitted.
    pub xmit_creds: bool,
    pub proto: Proto,
    pub layer: Layer,
    pub comp: CompressContext,

    // tls-auth parameters. Leave the key unset to disable tls-auth.
    pub tls_auth_key: Option<OpenVPNStaticKey>,
    pub tls_auth_digest: Digest,
    pub key_direction: KeyDirection,

    // Reliability layer parameters.
    pub reliable_window: usize,
    pub max_ack_list: usize,
    pub pid_mode: PidMode,

    // Timeouts, relative to key context construction.
    pub handshake_window: Duration,
    pub become_primary: Duration,
    pub renegotiate: Duration,
    pub expire: Duration,
    pub tls_timeout: Duration,

    pub keepalive_ping: Duration,
    pub keepalive_timeout: Duration,

    /// Extra `KEY=VALUE` lines for the client peer-info blob.
    pub extra_peer_info: Vec<(String, String)>,
    pub gui_version: String,

    /// Use the 4-byte DATA_V2 head on send.
    pub enable_op32: bool,
    pub remote_peer_id: Option<u32>,
    pub local_peer_id: Option<u32>,

    pub tun_mtu: u32,
}

impl Config {
    pub fn new(tls_factory: Arc<dyn TlsFactory>) -> Config {
        Config {
            tls_factory,
            dc_factory: Arc::new(RingDcFactory),
            dc: DcSettings {
                cipher: Cipher::BfCbc,
                digest: Digest::Sha1,
            },
            frame: Frame::default(),
            dc_deferred: false,
            xmit_creds: true,
            proto: Proto::Udp,
            layer: Layer::L3,
            comp: CompressContext::default(),
            tls_auth_key: None,
            tls_auth_digest: Digest::Sha1,
            key_direction: KeyDirection::Bidirectional,
            reliable_window: 4,
            max_ack_list: 4,
            pid_mode: PidMode::Udp,
            handshake_window: Duration::from_secs(60),
            become_primary: Duration::from_secs(60),
            renegotiate: Duration::from_secs(3600),
            expire: Duration::from_secs(7200),
            tls_timeout: Duration::from_secs(1),
            keepalive_ping: Duration::from_secs(8),
            keepalive_timeout: Duration::from_secs(40),
            extra_peer_info: Vec::new(),
            gui_version: String::new(),
            enable_op32: false,
            remote_peer_id: None,
            local_peer_id: None,
            tun_mtu: 1500,
        }
    }

    pub fn tls_auth_enabled(&self) -> bool {
        self.tls_auth_key.is_some()
    }

    /// Load local options. `server` adjusts the renegotiation schedule to
    /// avoid colliding with the client's.
    pub fn load(&mut self, opt: &OptionList, server: bool) -> Result<(), OptionError> {
        // dev-type
        {
            let dev = opt
                .get_arg("dev-type", 0)
                .or_else(|| opt.get_arg("dev", 0))
                .ok_or(OptionError::MissingDevType)?;
            if dev.starts_with("tun") {
                self.layer = Layer::L3;
            } else if dev.starts_with("tap") {
                self.layer = Layer::L2;
            } else {
                return Err(OptionError::BadDevType);
            }
        }

        // Data channel cipher/digest.
        if let Some(name) = opt.get_arg("cipher", 0) {
            self.dc.cipher =
                Cipher::lookup(name).ok_or_else(|| OptionError::UnknownCipher(name.into()))?;
        }
        if let Some(name) = opt.get_arg("auth", 0) {
            self.dc.digest =
                Digest::lookup(name).ok_or_else(|| OptionError::UnknownDigest(name.into()))?;
        }

        // tls-auth: the option argument is the key file body.
        if let Some(text) = opt.get_arg("tls-auth", 0) {
            self.tls_auth_key = Some(OpenVPNStaticKey::parse(text)?);
            if let Some(name) = opt.get_arg("tls-auth-digest", 0) {
                self.tls_auth_digest =
                    Digest::lookup(name).ok_or_else(|| OptionError::UnknownDigest(name.into()))?;
            }
        }

        if let Some(dir) = opt.get_arg("key-direction", 0) {
            self.key_direction = KeyDirection::parse(dir)?;
        }

        // Compression framing.
        if let Some(args) = opt.get("compress") {
            self.comp = match args.first().map(|s| s.as_str()) {
                None | Some("stub") | Some("stub-v2") => {
                    CompressContext::new(CompressMethod::Stub)
                }
                Some("lzo") => CompressContext::new(CompressMethod::LzoStub),
                Some(other) => return Err(OptionError::UnknownCompressor(other.into())),
            };
        } else if opt.get("comp-lzo").is_some() {
            self.comp = CompressContext::new(CompressMethod::LzoStub);
        }

        if let Some(mtu) = opt.get_arg("tun-mtu", 0) {
            self.tun_mtu = mtu
                .parse()
                .map_err(|_| OptionError::BadDuration("tun-mtu".into()))?;
        }

        self.load_common(opt, server)?;
        Ok(())
    }

    /// Apply options pushed by the server.
    pub fn process_push(&mut self, opt: &OptionList) -> Result<(), OptionError> {
        if let Some(name) = opt.get_arg("cipher", 0) {
            self.dc.cipher = Cipher::lookup(name)
                .ok_or_else(|| OptionError::PushRejected(format!("cipher {}", name)))?;
        }
        if let Some(name) = opt.get_arg("auth", 0) {
            self.dc.digest = Digest::lookup(name)
                .ok_or_else(|| OptionError::PushRejected(format!("auth {}", name)))?;
        }

        if opt.get("compress").is_some() {
            self.comp = CompressContext::new(CompressMethod::Stub);
        } else if opt.get("comp-lzo").is_some() {
            self.comp = CompressContext::new(CompressMethod::LzoStub);
        }

        if let Some(id) = opt.get_arg("peer-id", 0) {
            let id: u32 = id
                .parse()
                .ok()
                .filter(|&id| id <= 0xFF_FFFE)
                .ok_or_else(|| OptionError::PushRejected(format!("peer-id {}", id)))?;
            self.remote_peer_id = Some(id);
            self.enable_op32 = true;
        }

        self.load_common(opt, false)
            .map_err(|e| OptionError::PushRejected(e.to_string()))?;

        log::debug!(
            "negotiated options: cipher {} auth {} compress {:?} peer-id {:?}",
            self.dc.cipher.name(),
            self.dc.digest.name(),
            self.comp.method,
            self.remote_peer_id
        );
        Ok(())
    }

    // Parameters that may appear both locally and in a push.
    fn load_common(&mut self, opt: &OptionList, server: bool) -> Result<(), OptionError> {
        load_duration(&mut self.renegotiate, opt, "reneg-sec", 10, false)?;
        self.expire = self.renegotiate;
        load_duration(&mut self.expire, opt, "tran-window", 10, false)?;
        self.expire += self.renegotiate;
        load_duration(&mut self.handshake_window, opt, "hand-window", 10, false)?;

        if self.dc.cipher.is_bs64() {
            // Data-limited keys must rotate promptly (CVE-2016-6329).
            self.become_primary = Duration::from_secs(5);
            self.tls_timeout = Duration::from_millis(1000);
        } else {
            self.become_primary = self.handshake_window.min(self.renegotiate / 2);
        }
        load_duration(&mut self.become_primary, opt, "become-primary", 0, false)?;
        load_duration(&mut self.tls_timeout, opt, "tls-timeout", 100, true)?;

        if server {
            // Avoid renegotiation collision with the client.
            self.renegotiate += self.handshake_window;
        }

        if let Some(args) = opt.get("keepalive") {
            self.keepalive_ping = parse_duration(args.first(), "keepalive ping", 1, false)?;
            self.keepalive_timeout = parse_duration(args.get(1), "keepalive timeout", 1, false)?;
        } else {
            load_duration(&mut self.keepalive_ping, opt, "ping", 1, false)?;
            load_duration(&mut self.keepalive_timeout, opt, "ping-restart", 1, false)?;
        }
        Ok(())
    }

    pub fn set_protocol(&mut self, proto: Proto) {
        self.proto = proto;
        self.set_pid_mode(false);
    }

    /// Replay protection mode: the strict linear mode is only used on TCP,
    /// and only when requested.
    pub fn set_pid_mode(&mut self, tcp_linear: bool) {
        self.pid_mode = if self.proto.is_udp() || !tcp_linear {
            PidMode::Udp
        } else {
            PidMode::Tcp
        };
    }

    pub fn is_keepalive_enabled(&self) -> bool {
        self.keepalive_ping != DUR_INFINITE || self.keepalive_timeout != DUR_INFINITE
    }

    /// Bytes of overhead between a tunnel packet and the link datagram.
    pub fn link_mtu_adjust(&self) -> usize {
        self.proto.extra_transport_bytes()
            + if self.enable_op32 { 4 } else { 1 }
            + self.comp.extra_payload_bytes()
            + PacketId::SHORT_SIZE
            + self.dc.cipher.encap_overhead(self.dc.digest)
    }

    /// The canonical options string exchanged for the (informational)
    /// consistency check. Byte-stable for a given config.
    pub fn options_string(&self, server: bool) -> String {
        use std::fmt::Write;

        let l2extra = if self.layer == Layer::L2 { 32 } else { 0 };
        let mut out = String::new();
        out.push_str("V4");
        let _ = write!(out, ",dev-type {}", self.layer.dev_type());
        let _ = write!(
            out,
            ",link-mtu {}",
            self.tun_mtu as usize + self.link_mtu_adjust() + l2extra
        );
        let _ = write!(out, ",tun-mtu {}", self.tun_mtu as usize + l2extra);
        let _ = write!(out, ",proto {}", self.proto.str_client());

        if let Some(comp) = self.comp.options_string() {
            let _ = write!(out, ",{}", comp);
        }

        match self.key_direction {
            KeyDirection::Zero => out.push_str(",keydir 0"),
            KeyDirection::One => out.push_str(",keydir 1"),
            KeyDirection::Bidirectional => {}
        }

        let cipher = match self.dc.cipher {
            Cipher::None => "[null-cipher]",
            c => c.name(),
        };
        let digest = match self.dc.digest {
            Digest::None => "[null-digest]",
            d => d.name(),
        };
        let _ = write!(out, ",cipher {}", cipher);
        let _ = write!(out, ",auth {}", digest);
        let _ = write!(out, ",keysize {}", self.dc.cipher.key_length() * 8);

        if self.tls_auth_enabled() {
            out.push_str(",tls-auth");
        }
        out.push_str(",key-method 2");
        out.push_str(if server { ",tls-server" } else { ",tls-client" });
        out
    }

    /// The client capability blob, newline-separated `KEY=VALUE` lines.
    pub fn peer_info_string(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        if !self.gui_version.is_empty() {
            let _ = writeln!(out, "IV_GUI_VER={}", self.gui_version);
        }
        let _ = writeln!(out, "IV_VER={}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "IV_PLAT={}", platform_name());
        out.push_str("IV_NCP=2\n");
        out.push_str("IV_TCPNL=1\n");
        out.push_str("IV_PROTO=2\n");
        if let Some(comp) = self.comp.peer_info_string() {
            out.push_str(comp);
        }
        for (k, v) in &self.extra_peer_info {
            let _ = writeln!(out, "{}={}", k, v);
        }
        if self.dc.cipher.is_bs64() {
            out.push_str("IV_BS64DL=1\n");
        }
        out
    }
}

fn parse_duration(
    arg: Option<&String>,
    what: &str,
    min: u64,
    millis: bool,
) -> Result<Duration, OptionError> {
    let arg = arg.ok_or_else(|| OptionError::BadDuration(what.into()))?;
    let v: u64 = arg
        .parse()
        .map_err(|_| OptionError::BadDuration(what.into()))?;
    let v = v.max(min);
    Ok(if millis {
        Duration::from_millis(v)
    } else {
        Duration::from_secs(v)
    })
}

fn load_duration(
    dst: &mut Duration,
    opt: &OptionList,
    name: &str,
    min: u64,
    millis: bool,
) -> Result<(), OptionError> {
    if let Some(args) = opt.get(name) {
        *dst = parse_duration(args.first(), name, min, millis)?;
    }
    Ok(())
}
