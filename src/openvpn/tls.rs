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

//! Interface to the external TLS implementation. The engine only moves
//! bytes: ciphertext chunks travel over the reliable control channel,
//! cleartext carries the handshake payload and app control messages.

use crate::openvpn::error::Error;
use crate::openvpn::Mode;

/// One TLS session, memory-BIO style.
///
/// Implementations must tolerate `write_ciphertext` before
/// `start_handshake`: on the passive side, peer handshake records can be
/// delivered by the reliability layer before the local state machine starts
/// the session.
pub trait TlsSession {
    fn start_handshake(&mut self) -> Result<(), Error>;

    fn handshake_done(&self) -> bool;

    /// Feed one ciphertext chunk received from the peer.
    fn write_ciphertext(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Pull the next outgoing ciphertext chunk, if any.
    fn read_ciphertext(&mut self) -> Option<Vec<u8>>;

    /// Queue cleartext for the peer. May be called before the handshake
    /// completes; the data is flushed once it does.
    fn write_cleartext(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Pull decrypted cleartext received from the peer, if any.
    fn read_cleartext(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// The peer certificate, DER encoded, once the handshake has produced
    /// one. Handed to the host together with the client's credentials.
    fn auth_cert(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Factory producing one [`TlsSession`] per key context.
pub trait TlsFactory {
    fn new_session(&self, mode: Mode) -> Box<dyn TlsSession>;
}
