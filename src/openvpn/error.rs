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

//! Protocol error kinds and the per-session counters they feed.

use thiserror::Error;

/// Protocol-level error kinds. Every kind is counted in [`SessionStats`];
/// fatal kinds additionally invalidate the key context or session they occur
/// on. Transient kinds become fatal on stream transports, which cannot
/// resynchronize after a framing mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("replay detected on an authenticated packet")]
    Replay,
    #[error("data channel decrypt failed")]
    Decrypt,
    #[error("HMAC verification failed")]
    Hmac,
    #[error("malformed packet")]
    Buffer,
    #[error("control channel framing mismatch")]
    CcError,
    #[error("bad auth message prefix")]
    BadAuthPrefix,
    #[error("control message exceeds maximum size")]
    AppMsgTooLarge,
    #[error("compression framing error")]
    Compress,
    #[error("TLS layer failure")]
    Tls,
    #[error("data channel initialization failed")]
    DataChannel,
    #[error("no packet received within the keepalive timeout")]
    KeepaliveTimeout,
    #[error("handshake did not complete within the negotiation window")]
    HandshakeTimeout,
    #[error("primary key expired with no secondary to promote")]
    PrimaryExpire,
    #[error("no peer packet arrived to confirm the pending key")]
    KevPending,
    #[error("negotiation deadline expired")]
    KevNegotiate,
    #[error("key context expired")]
    KevExpire,
    #[error("per-key data limit reached")]
    KeyLimitReneg,
}

pub const ERROR_KINDS: usize = 17;

impl Error {
    fn index(self) -> usize {
        match self {
            Error::Replay => 0,
            Error::Decrypt => 1,
            Error::Hmac => 2,
            Error::Buffer => 3,
            Error::CcError => 4,
            Error::BadAuthPrefix => 5,
            Error::AppMsgTooLarge => 6,
            Error::Compress => 7,
            Error::Tls => 8,
            Error::DataChannel => 9,
            Error::KeepaliveTimeout => 10,
            Error::HandshakeTimeout => 11,
            Error::PrimaryExpire => 12,
            Error::KevPending => 13,
            Error::KevNegotiate => 14,
            Error::KevExpire => 15,
            Error::KeyLimitReneg => 16,
        }
    }
}

/// Per-session error counters; the statistics sink of the engine.
pub struct SessionStats {
    counts: [u64; ERROR_KINDS],
    last_error: Option<Error>,
}

impl Default for SessionStats {
    fn default() -> SessionStats {
        SessionStats::new()
    }
}

impl SessionStats {
    pub fn new() -> SessionStats {
        SessionStats {
            counts: [0; ERROR_KINDS],
            last_error: None,
        }
    }

    pub fn error(&mut self, e: Error) {
        log::debug!("stats: {}", e);
        self.counts[e.index()] += 1;
        self.last_error = Some(e);
    }

    pub fn count(&self, e: Error) -> u64 {
        self.counts[e.index()]
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }
}

/// Synchronous configuration errors, raised while loading options or
/// accepting a server push.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("missing dev-type or dev option")]
    MissingDevType,
    #[error("bad dev-type")]
    BadDevType,
    #[error("unknown cipher: {0}")]
    UnknownCipher(String),
    #[error("unknown digest: {0}")]
    UnknownDigest(String),
    #[error("cipher not available in this build: {0}")]
    UnsupportedCipher(String),
    #[error("bad key-direction parameter")]
    BadKeyDirection,
    #[error("unknown compressor: {0}")]
    UnknownCompressor(String),
    #[error("bad duration parameter: {0}")]
    BadDuration(String),
    #[error("bad static key")]
    BadStaticKey,
    #[error("rejected server-pushed option: {0}")]
    PushRejected(String),
}
