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

//! TiOVPN: the OpenVPN protocol engine as a pure, host-driven state
//! machine. No sockets, no threads, no clock of its own; see
//! [`openvpn::ProtoContext`] for the entry points.

/// Packet buffers with headroom/tailroom.
pub mod buffer;
/// Crypto primitive wrappers and the algorithm registry.
pub mod crypto;
/// The protocol implementation.
pub mod openvpn;
/// Engine time values.
pub mod time;
