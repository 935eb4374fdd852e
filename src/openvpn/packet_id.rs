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

//! Packet IDs and the replay window.
//!
//! The long form (counter + time) protects authenticated control packets;
//! the short form (counter only) lives inside data channel crypto. Send
//! counters are strictly monotonic starting at 1; a counter of 0 marks an
//! invalid/unset ID.

use crate::buffer::{BufResult, Buffer};

/// A received or sent packet ID. `time` is 0 for the short form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketId {
    pub id: u32,
    pub time: u32,
}

impl PacketId {
    pub const SHORT_SIZE: usize = 4;
    pub const LONG_SIZE: usize = 8;

    pub fn is_valid(self) -> bool {
        self.id != 0
    }

    pub fn read_long(buf: &mut Buffer) -> BufResult<PacketId> {
        let id = buf.read_u32_be()?;
        let time = buf.read_u32_be()?;
        Ok(PacketId { id, time })
    }

    pub fn read_short(buf: &mut Buffer) -> BufResult<PacketId> {
        let id = buf.read_u32_be()?;
        Ok(PacketId { id, time: 0 })
    }
}

/// Counter close enough to 32-bit wraparound that the key must be
/// renegotiated before the replay window is poisoned.
const WRAP_WARN: u32 = 0xFF00_0000;

/// Send-side packet ID source.
#[derive(Debug)]
pub struct PacketIdSend {
    id: u32,
    time: u32,
    long_form: bool,
}

impl PacketIdSend {
    pub fn new(long_form: bool) -> PacketIdSend {
        PacketIdSend {
            id: 0,
            time: 0,
            long_form,
        }
    }

    /// Produce the next ID. The bool is the wrap warning: the short-form
    /// counter is approaching wraparound and the caller should schedule a
    /// rekey. The long form instead steps `time` forward and restarts the
    /// counter.
    pub fn next(&mut self, now_secs: u32) -> (PacketId, bool) {
        if self.long_form {
            if self.time == 0 {
                self.time = now_secs.max(1);
            }
            if self.id == u32::MAX {
                self.time = now_secs.max(self.time + 1);
                self.id = 1;
            } else {
                self.id += 1;
            }
            (
                PacketId {
                    id: self.id,
                    time: self.time,
                },
                false,
            )
        } else {
            self.id = self.id.wrapping_add(1);
            (PacketId {
                id: self.id,
                time: 0,
            }, self.id >= WRAP_WARN)
        }
    }

    /// Produce the next long-form ID and prepend it to `buf`.
    pub fn prepend_next(&mut self, buf: &mut Buffer, now_secs: u32) {
        let (pid, _) = self.next(now_secs);
        buf.prepend_u32_be(pid.time);
        buf.prepend_u32_be(pid.id);
    }
}

/// Replay protection mode. Datagram transports tolerate reordering within a
/// sliding window; stream transports require strictly increasing IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidMode {
    Udp,
    Tcp,
}

const WINDOW: u32 = 64;

/// Test-and-add replay window over received packet IDs. `test` answers
/// whether an ID would be accepted without changing state, so a packet can
/// be fully authenticated before the ID is committed with `add`.
///
/// In UDP mode the window covers the 64 IDs strictly below the highest ID
/// accepted so far (`head`): bit `d - 1` of the bitmap marks `head - d` as
/// seen. A newer time value opens a fresh epoch; an older one is rejected
/// outright.
#[derive(Debug)]
pub struct ReplayWindow {
    mode: PidMode,
    time: u32,
    head: u32,
    bitmap: u64,
    seen_any: bool,
}

impl ReplayWindow {
    pub fn new(mode: PidMode) -> ReplayWindow {
        ReplayWindow {
            mode,
            time: 0,
            head: 0,
            bitmap: 0,
            seen_any: false,
        }
    }

    pub fn test(&self, pid: PacketId) -> bool {
        if !pid.is_valid() {
            return false;
        }
        match self.mode {
            PidMode::Tcp => {
                !self.seen_any || (pid.time, pid.id) > (self.time, self.head)
            }
            PidMode::Udp => {
                if !self.seen_any || pid.time > self.time {
                    return true;
                }
                if pid.time < self.time {
                    return false;
                }
                if pid.id > self.head {
                    return true;
                }
                if pid.id == self.head {
                    return false;
                }
                let diff = self.head - pid.id;
                if diff > WINDOW {
                    return false;
                }
                self.bitmap & (1u64 << (diff - 1)) == 0
            }
        }
    }

    /// Commit an ID that passed `test`.
    pub fn add(&mut self, pid: PacketId) {
        match self.mode {
            PidMode::Tcp => {
                self.time = pid.time;
                self.head = pid.id;
            }
            PidMode::Udp => {
                if !self.seen_any || pid.time > self.time {
                    self.time = pid.time;
                    self.head = pid.id;
                    self.bitmap = 0;
                } else if pid.id > self.head {
                    // Old head slides into the window at distance `shift`.
                    let shift = pid.id - self.head;
                    self.bitmap = if shift > WINDOW {
                        0
                    } else if shift == WINDOW {
                        1u64 << (WINDOW - 1)
                    } else {
                        (self.bitmap << shift) | (1u64 << (shift - 1))
                    };
                    self.head = pid.id;
                } else {
                    self.bitmap |= 1u64 << (self.head - pid.id - 1);
                }
            }
        }
        self.seen_any = true;
    }

    /// `test` and `add` in one step.
    pub fn test_add(&mut self, pid: PacketId) -> bool {
        if self.test(pid) {
            self.add(pid);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: u32) -> PacketId {
        PacketId { id, time: 1000 }
    }

    #[test]
    fn send_ids_start_at_one() {
        let mut s = PacketIdSend::new(false);
        assert_eq!(s.next(0).0, PacketId { id: 1, time: 0 });
        assert_eq!(s.next(0).0, PacketId { id: 2, time: 0 });
    }

    #[test]
    fn long_form_wire_order() {
        let mut s = PacketIdSend::new(true);
        let mut buf = Buffer::new();
        s.prepend_next(&mut buf, 7);
        assert_eq!(buf.len(), PacketId::LONG_SIZE);
        let p = PacketId::read_long(&mut buf).unwrap();
        assert_eq!(p, PacketId { id: 1, time: 7 });
    }

    #[test]
    fn short_form_wrap_warning() {
        let mut s = PacketIdSend::new(false);
        s.id = WRAP_WARN - 2;
        assert!(!s.next(0).1);
        assert!(s.next(0).1);
    }

    #[test]
    fn udp_window_boundaries() {
        let mut w = ReplayWindow::new(PidMode::Udp);
        let n = 100;
        assert!(w.test_add(pid(n)));
        // Same id again is a replay.
        assert!(!w.test_add(pid(n)));
        assert!(w.test_add(pid(n + 1)));
        // 64 ids below the head are tracked: n - 63 is the oldest acceptable.
        assert!(w.test_add(pid(n - 63)));
        assert!(!w.test_add(pid(n - 64)));
    }

    #[test]
    fn udp_reorder_within_window() {
        let mut w = ReplayWindow::new(PidMode::Udp);
        assert!(w.test_add(pid(10)));
        assert!(w.test_add(pid(5)));
        assert!(!w.test_add(pid(5)));
        assert!(w.test_add(pid(6)));
        assert!(w.test_add(pid(11)));
    }

    #[test]
    fn udp_time_epochs() {
        let mut w = ReplayWindow::new(PidMode::Udp);
        assert!(w.test_add(PacketId { id: 50, time: 10 }));
        // Newer time resets the window; the counter may restart.
        assert!(w.test_add(PacketId { id: 1, time: 11 }));
        // Older time is always rejected.
        assert!(!w.test(PacketId { id: 60, time: 10 }));
    }

    #[test]
    fn test_does_not_commit() {
        let mut w = ReplayWindow::new(PidMode::Udp);
        assert!(w.test(pid(7)));
        assert!(w.test(pid(7)));
        w.add(pid(7));
        assert!(!w.test(pid(7)));
    }

    #[test]
    fn tcp_strictly_increasing() {
        let mut w = ReplayWindow::new(PidMode::Tcp);
        assert!(w.test_add(pid(5)));
        assert!(!w.test_add(pid(5)));
        assert!(!w.test_add(pid(4)));
        assert!(w.test_add(pid(6)));
        // A time step forward allows a counter restart.
        assert!(w.test_add(PacketId { id: 1, time: 1001 }));
    }
}
