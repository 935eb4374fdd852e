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

//! Packet head encoding and incoming packet classification.
//!
//! The first byte of every packet carries the opcode in the upper 5 bits and
//! the key ID in the lower 3. `DATA_V2` extends the head to 4 bytes with a
//! 24-bit peer ID.

use crate::buffer::Buffer;
use crate::openvpn::Mode;

pub const KEY_ID_MASK: u8 = 0x07;
pub const OPCODE_SHIFT: u8 = 3;

// Packet opcodes. V1 hard resets belong to the obsolete key-method 1
// handshake and are not recognized.
pub const CONTROL_SOFT_RESET_V1: u8 = 3;
pub const CONTROL_V1: u8 = 4;
pub const ACK_V1: u8 = 5;
pub const DATA_V1: u8 = 6;
pub const CONTROL_HARD_RESET_CLIENT_V2: u8 = 7;
pub const CONTROL_HARD_RESET_SERVER_V2: u8 = 8;
pub const DATA_V2: u8 = 9;

/// Size of the DATA_V2 head: op byte plus 24-bit peer ID.
pub const OP_SIZE_V2: usize = 4;
/// Peer ID value meaning "undefined".
pub const OP_PEER_ID_UNDEF: u32 = 0x00FF_FFFF;

pub fn opcode_extract(op: u8) -> u8 {
    op >> OPCODE_SHIFT
}

pub fn key_id_extract(op: u8) -> u8 {
    op & KEY_ID_MASK
}

pub fn op_compose(opcode: u8, key_id: u8) -> u8 {
    (opcode << OPCODE_SHIFT) | key_id
}

/// The 32-bit DATA_V2 head: op byte followed by the peer ID.
pub fn op32_compose(opcode: u8, key_id: u8, peer_id: Option<u32>) -> u32 {
    let peer_id = peer_id.unwrap_or(OP_PEER_ID_UNDEF);
    (u32::from(op_compose(opcode, key_id)) << 24) | (peer_id & OP_PEER_ID_UNDEF)
}

/// Head size of a data packet given its leading byte.
pub fn op_head_size(op: u8) -> usize {
    if opcode_extract(op) == DATA_V2 {
        OP_SIZE_V2
    } else {
        1
    }
}

pub fn opcode_name(opcode: u8) -> Option<&'static str> {
    match opcode {
        CONTROL_SOFT_RESET_V1 => Some("CONTROL_SOFT_RESET_V1"),
        CONTROL_V1 => Some("CONTROL_V1"),
        ACK_V1 => Some("ACK_V1"),
        DATA_V1 => Some("DATA_V1"),
        DATA_V2 => Some("DATA_V2"),
        CONTROL_HARD_RESET_CLIENT_V2 => Some("CONTROL_HARD_RESET_CLIENT_V2"),
        CONTROL_HARD_RESET_SERVER_V2 => Some("CONTROL_HARD_RESET_SERVER_V2"),
        _ => None,
    }
}

/// A control channel PDU: the opcode it travels under plus its payload.
/// Initial resets travel with an empty payload ("raw" packets); TLS
/// ciphertext travels under `CONTROL_V1`.
#[derive(Clone)]
pub struct Packet {
    pub opcode: u8,
    pub buf: Buffer,
}

impl Packet {
    pub fn new(opcode: u8, buf: Buffer) -> Packet {
        Packet { opcode, buf }
    }

    /// Raw packets bypass the TLS layer (resets, ACK-only).
    pub fn is_raw(&self) -> bool {
        self.opcode != CONTROL_V1
    }
}

const F_DEFINED: u8 = 1 << 0;
const F_CONTROL: u8 = 1 << 1;
const F_SECONDARY: u8 = 1 << 2;
const F_SOFT_RESET: u8 = 1 << 3;

/// Classification of an incoming packet, decided before any cryptographic
/// work: channel, owning key context, and the DATA_V2 peer ID if present.
#[derive(Debug, Clone, Copy)]
pub struct PacketType {
    flags: u8,
    pub opcode: u8,
    peer_id: Option<u32>,
}

impl PacketType {
    pub fn is_defined(&self) -> bool {
        self.flags & F_DEFINED != 0
    }

    pub fn is_control(&self) -> bool {
        self.flags & (F_CONTROL | F_DEFINED) == (F_CONTROL | F_DEFINED)
    }

    pub fn is_data(&self) -> bool {
        self.flags & (F_CONTROL | F_DEFINED) == F_DEFINED
    }

    pub fn is_secondary(&self) -> bool {
        self.flags & F_SECONDARY != 0
    }

    pub fn is_soft_reset(&self) -> bool {
        let want = F_CONTROL | F_DEFINED | F_SECONDARY | F_SOFT_RESET;
        self.flags & want == want
    }

    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }
}

/// Classify an incoming buffer. `primary`/`secondary` are the key IDs of the
/// existing key contexts; `upcoming` is the key ID a peer-initiated soft
/// reset would create. Unrecognized opcodes, role-invalid hard resets and
/// short DATA_V2 packets come back undefined.
pub fn classify(
    buf: &[u8],
    mode: Mode,
    primary: Option<u8>,
    secondary: Option<u8>,
    upcoming: u8,
) -> PacketType {
    let mut t = PacketType {
        flags: 0,
        opcode: 0,
        peer_id: None,
    };
    let op = match buf.first() {
        Some(&op) => op,
        None => return t,
    };

    match opcode_extract(op) {
        opc @ (CONTROL_SOFT_RESET_V1 | CONTROL_V1 | ACK_V1) => {
            t.flags |= F_CONTROL;
            t.opcode = opc;
        }
        DATA_V2 => {
            if buf.len() < OP_SIZE_V2 {
                return t;
            }
            let opi = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) & OP_PEER_ID_UNDEF;
            if opi != OP_PEER_ID_UNDEF {
                t.peer_id = Some(opi);
            }
            t.opcode = DATA_V2;
        }
        DATA_V1 => {
            t.opcode = DATA_V1;
        }
        CONTROL_HARD_RESET_CLIENT_V2 => {
            if !mode.is_server() {
                return t;
            }
            t.flags |= F_CONTROL;
            t.opcode = CONTROL_HARD_RESET_CLIENT_V2;
        }
        CONTROL_HARD_RESET_SERVER_V2 => {
            if mode.is_server() {
                return t;
            }
            t.flags |= F_CONTROL;
            t.opcode = CONTROL_HARD_RESET_SERVER_V2;
        }
        _ => return t,
    }

    let kid = key_id_extract(op);
    if primary == Some(kid) {
        t.flags |= F_DEFINED;
    } else if secondary == Some(kid) {
        t.flags |= F_DEFINED | F_SECONDARY;
    } else if t.opcode == CONTROL_SOFT_RESET_V1 && kid == upcoming {
        t.flags |= F_DEFINED | F_SECONDARY | F_SOFT_RESET;
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_byte_composition() {
        let op = op_compose(CONTROL_HARD_RESET_CLIENT_V2, 0);
        assert_eq!(op, 0x38);
        assert_eq!(opcode_extract(op), CONTROL_HARD_RESET_CLIENT_V2);
        assert_eq!(key_id_extract(op), 0);

        let op = op_compose(DATA_V2, 5);
        assert_eq!(opcode_extract(op), DATA_V2);
        assert_eq!(key_id_extract(op), 5);
        assert_eq!(op_head_size(op), OP_SIZE_V2);
        assert_eq!(op_head_size(op_compose(DATA_V1, 5)), 1);
    }

    #[test]
    fn op32_peer_id() {
        let op32 = op32_compose(DATA_V2, 1, Some(0x1234));
        assert_eq!(op32, 0x49_00_12_34);
        assert_eq!(op32_compose(DATA_V2, 1, None) & OP_PEER_ID_UNDEF, OP_PEER_ID_UNDEF);
    }

    #[test]
    fn classify_routes_by_key_id() {
        let buf = [op_compose(CONTROL_V1, 0)];
        let t = classify(&buf, Mode::Client, Some(0), None, 1);
        assert!(t.is_control() && !t.is_secondary());

        let buf = [op_compose(CONTROL_V1, 1)];
        let t = classify(&buf, Mode::Client, Some(0), Some(1), 2);
        assert!(t.is_control() && t.is_secondary());

        // Unknown key id.
        let buf = [op_compose(CONTROL_V1, 5)];
        let t = classify(&buf, Mode::Client, Some(0), Some(1), 2);
        assert!(!t.is_defined());
    }

    #[test]
    fn classify_soft_reset_upcoming() {
        let buf = [op_compose(CONTROL_SOFT_RESET_V1, 2)];
        let t = classify(&buf, Mode::Server, Some(0), None, 2);
        assert!(t.is_soft_reset());
        // Only a soft reset matches on the upcoming key id.
        let buf = [op_compose(CONTROL_V1, 2)];
        assert!(!classify(&buf, Mode::Server, Some(0), None, 2).is_defined());
    }

    #[test]
    fn classify_rejects_role_mismatched_resets() {
        let client_reset = [op_compose(CONTROL_HARD_RESET_CLIENT_V2, 0)];
        assert!(!classify(&client_reset, Mode::Client, Some(0), None, 1).is_defined());
        assert!(classify(&client_reset, Mode::Server, Some(0), None, 1).is_control());

        let server_reset = [op_compose(CONTROL_HARD_RESET_SERVER_V2, 0)];
        assert!(!classify(&server_reset, Mode::Server, Some(0), None, 1).is_defined());
        assert!(classify(&server_reset, Mode::Client, Some(0), None, 1).is_control());
    }

    #[test]
    fn classify_data() {
        let buf = [op_compose(DATA_V1, 0), 0xaa];
        let t = classify(&buf, Mode::Client, Some(0), None, 1);
        assert!(t.is_data());
        assert_eq!(t.peer_id(), None);

        let buf = [op_compose(DATA_V2, 0), 0x00, 0x00, 0x07, 0xaa];
        let t = classify(&buf, Mode::Client, Some(0), None, 1);
        assert!(t.is_data());
        assert_eq!(t.peer_id(), Some(7));

        // Short DATA_V2 is dropped.
        let buf = [op_compose(DATA_V2, 0), 0x00];
        assert!(!classify(&buf, Mode::Client, Some(0), None, 1).is_defined());
    }
}
