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

//! OpenVPN protocol engine.
//!
//! A peer-symmetric state machine that establishes an authenticated,
//! encrypted tunnel: a TLS handshake carried over a reliable,
//! replay-protected control channel, data packets framed over the same
//! transport, and in-session rekeying without interrupting data flow. The
//! engine performs no I/O; the host feeds it packets, drains its output and
//! drives its clock.

/// Compression framing stubs.
mod compress;
/// Data channel crypto instances and data limits.
mod data_channel;
/// Error kinds, session statistics, option errors.
mod error;
/// Key context: handshake + reliability + data channel state machine.
mod key_state;
/// Configuration and option negotiation.
mod options;
/// Packet head encoding and classification.
mod packet;
/// Packet IDs and replay windows.
mod packet_id;
/// Protocol session IDs.
mod psid;
/// Reliable send/recv and ACK collation.
mod reliable;
/// The protocol context owning the primary/secondary key pair.
mod session;
/// TLS collaborator interface.
mod tls;
/// Control channel HMAC ("tls-auth") and static keys.
mod tls_auth;
/// Session key derivation (TLS 1.0 PRF).
mod tlsprf;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::compress::{CompressContext, CompressMethod};
pub use self::data_channel::{
    DataLimit, DcFactory, DcInstance, DcSettings, DlMode, DlState, RingDcFactory,
    BS64_DATA_LIMIT,
};
pub use self::error::{Error, OptionError, SessionStats};
pub use self::key_state::{
    read_auth_string, write_auth_string, write_empty_string, Event, KeyContext, State,
};
pub use self::options::{Config, Layer, OptionList, Proto};
pub use self::packet::{opcode_name, Packet, PacketType};
pub use self::packet_id::{PacketId, PacketIdSend, PidMode, ReplayWindow};
pub use self::psid::Psid;
pub use self::session::{ProtoContext, ProtoHost, SessionShared, TlsWrap};
pub use self::tls::{TlsFactory, TlsSession};
pub use self::tls_auth::{KeyDirection, OpenVPNStaticKey, TlsAuth, TlsAuthPreValidate};
pub use self::tlsprf::TlsPrf;

/// Client or server role of this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    pub fn is_server(self) -> bool {
        self == Mode::Server
    }

    pub fn is_client(self) -> bool {
        self == Mode::Client
    }
}

/// Upper bound on one app-level control message, in either direction.
pub const APP_MSG_MAX: usize = 65536;

/// Prefix of the key-method 2 auth message.
pub const AUTH_PREFIX: [u8; 5] = [0, 0, 0, 0, 2];

/// Marker payload sent inside an encrypted data packet to keep the session
/// alive; discarded on receive.
pub const KEEPALIVE_MESSAGE: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Marker payload a disconnecting UDP client sends so the server can drop
/// the session immediately. The trailing byte is the OCC_EXIT code.
pub const EXPLICIT_EXIT_NOTIFY_MESSAGE: [u8; 17] = [
    0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5, 0x45,
    0x9c, 0x06,
];

/// Is this decrypted data packet the keepalive marker?
pub fn is_keepalive(buf: &[u8]) -> bool {
    buf.len() >= KEEPALIVE_MESSAGE.len()
        && buf[0] == KEEPALIVE_MESSAGE[0]
        && buf[..KEEPALIVE_MESSAGE.len()] == KEEPALIVE_MESSAGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_marker() {
        assert!(is_keepalive(&KEEPALIVE_MESSAGE));
        let mut long = KEEPALIVE_MESSAGE.to_vec();
        long.push(0xFF);
        assert!(is_keepalive(&long));
        assert!(!is_keepalive(&KEEPALIVE_MESSAGE[..15]));
        assert!(!is_keepalive(&EXPLICIT_EXIT_NOTIFY_MESSAGE));
        let mut other = KEEPALIVE_MESSAGE;
        other[5] ^= 1;
        assert!(!is_keepalive(&other));
    }
}
