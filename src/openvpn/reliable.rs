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

//! Windowed reliable delivery for the control channel: an id-keyed send
//! queue with retransmit deadlines, a receive reorder window, and the ACK
//! list that rides on outgoing packets.
//!
//! Message sequence ids are 32-bit, starting at 0 for each key context.

use std::collections::VecDeque;

use crate::buffer::{BufResult, Buffer};
use crate::openvpn::packet::Packet;
use crate::time::{Duration, Time};

/// Retransmit backoff doubles from the base timeout up to this cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct SendEntry {
    id: u32,
    /// Unframed payload, kept so the packet can be encapsulated on first
    /// transmit with the ACKs current at that moment.
    packet: Packet,
    /// Fully framed bytes, captured at first transmit and resent verbatim.
    framed: Option<Vec<u8>>,
    retransmit_at: Time,
    retries: u32,
    timeout: Duration,
}

/// Send side: up to `window` unacknowledged messages in flight.
pub struct ReliableSend {
    next_id: u32,
    timeout: Duration,
    entries: Vec<Option<SendEntry>>,
}

impl ReliableSend {
    pub fn new(window: usize, timeout: Duration) -> ReliableSend {
        let mut entries = Vec::new();
        entries.resize_with(window.max(1), || None);
        ReliableSend {
            next_id: 0,
            timeout,
            entries,
        }
    }

    /// Is there room for another message?
    pub fn ready(&self) -> bool {
        self.entries.iter().any(|e| e.is_none())
    }

    pub fn n_unacked(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Queue a message for (re)transmission, assigning its sequence id.
    /// Returns `None` when the window is full.
    pub fn send(&mut self, packet: Packet, now: Time) -> Option<u32> {
        let slot = self.entries.iter_mut().find(|e| e.is_none())?;
        let id = self.next_id;
        self.next_id += 1;
        let timeout = self.timeout;
        *slot = Some(SendEntry {
            id,
            packet,
            framed: None,
            retransmit_at: now,
            retries: 0,
            timeout,
        });
        Some(id)
    }

    /// Retire a message the peer has acknowledged.
    pub fn ack(&mut self, id: u32) -> bool {
        for e in self.entries.iter_mut() {
            if e.as_ref().map(|e| e.id) == Some(id) {
                *e = None;
                return true;
            }
        }
        false
    }

    /// Earliest deadline among queued messages.
    pub fn next_retransmit(&self) -> Time {
        self.entries
            .iter()
            .flatten()
            .map(|e| e.retransmit_at)
            .min()
            .unwrap_or(Time::INFINITE)
    }

    /// Ids of messages whose deadline has passed.
    pub fn due(&self, now: Time) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .entries
            .iter()
            .flatten()
            .filter(|e| e.retransmit_at <= now)
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Mark a due message transmitted, pushing its deadline out with
    /// exponential backoff. Returns the payload to frame (first transmit)
    /// or the previously framed bytes, plus whether this is a retransmit.
    pub fn transmit(&mut self, id: u32, now: Time) -> Option<(TransmitPayload<'_>, bool)> {
        let e = self
            .entries
            .iter_mut()
            .flatten()
            .find(|e| e.id == id)?;
        let is_retransmit = e.retries > 0;
        e.retransmit_at = now + e.timeout;
        e.timeout = (e.timeout * 2).min(MAX_BACKOFF);
        e.retries += 1;
        let payload = match &e.framed {
            Some(bytes) => TransmitPayload::Framed(bytes),
            None => TransmitPayload::Fresh(&e.packet),
        };
        Some((payload, is_retransmit))
    }

    /// Record the framed bytes of a first transmission for later resends.
    pub fn set_framed(&mut self, id: u32, framed: Vec<u8>) {
        if let Some(e) = self.entries.iter_mut().flatten().find(|e| e.id == id) {
            e.framed = Some(framed);
        }
    }
}

pub enum TransmitPayload<'a> {
    Fresh(&'a Packet),
    Framed(&'a Vec<u8>),
}

/// Receive side disposition of one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvFlags {
    /// Message landed in the reorder window (first sight).
    pub in_window: bool,
    /// The sender needs an ACK, even if this was a duplicate; without the
    /// re-ACK a peer whose ACK was lost would retransmit forever.
    pub ack_to_sender: bool,
}

/// Receive side: reorders messages into sequence id order.
pub struct ReliableRecv {
    head: u32,
    slots: Vec<Option<Packet>>,
}

impl ReliableRecv {
    pub fn new(window: usize) -> ReliableRecv {
        let mut slots = Vec::new();
        slots.resize_with(window.max(1), || None);
        ReliableRecv {
            head: 0,
            slots,
        }
    }

    pub fn receive(&mut self, packet: Packet, id: u32) -> RecvFlags {
        if id < self.head {
            // Already delivered; the peer evidently missed our ACK.
            return RecvFlags {
                in_window: false,
                ack_to_sender: true,
            };
        }
        let len = self.slots.len() as u32;
        if id >= self.head + len {
            return RecvFlags {
                in_window: false,
                ack_to_sender: false,
            };
        }
        let slot = &mut self.slots[(id % len) as usize];
        let in_window = slot.is_none();
        if in_window {
            *slot = Some(packet);
        }
        RecvFlags {
            in_window,
            ack_to_sender: true,
        }
    }

    /// Pop the next in-order message, if it has arrived.
    pub fn next_sequenced(&mut self) -> Option<Packet> {
        let len = self.slots.len() as u32;
        let slot = &mut self.slots[(self.head % len) as usize];
        let packet = slot.take()?;
        self.head += 1;
        Some(packet)
    }
}

/// Outbound ACK queue. Each outgoing control packet carries up to
/// `max_ack_list` ids as `[count u8][id u32 BE]...`.
#[derive(Default)]
pub struct AckList {
    ids: VecDeque<u32>,
}

impl AckList {
    pub fn new() -> AckList {
        AckList::default()
    }

    pub fn push(&mut self, id: u32) {
        self.ids.push_back(id);
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Prepend up to `max` queued ids to `buf`; the rest stay queued for the
    /// next packet.
    pub fn prepend(&mut self, buf: &mut Buffer, max: usize) {
        let n = self.ids.len().min(max).min(0xFF);
        for i in (0..n).rev() {
            buf.prepend_u32_be(self.ids[i]);
        }
        buf.push_front(n as u8);
        self.ids.drain(..n);
    }

    /// Read an ACK block.
    pub fn read(buf: &mut Buffer) -> BufResult<Vec<u32>> {
        let n = buf.read_u8()?;
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            ids.push(buf.read_u32_be()?);
        }
        Ok(ids)
    }

    /// Skip an ACK block, reporting whether it was non-empty.
    pub fn skip(buf: &mut Buffer) -> BufResult<bool> {
        let n = buf.read_u8()?;
        buf.advance(usize::from(n) * 4)?;
        Ok(n > 0)
    }
}
