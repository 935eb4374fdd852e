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

//! Engine time. The protocol context never reads a system clock; the host
//! feeds it time values via `update_now`, so tests can fabricate clocks.

use std::ops::{Add, AddAssign, Sub};

pub use std::time::Duration;

/// A point on the host-provided monotonic clock, in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    pub const ZERO: Time = Time(0);
    /// Sentinel for "never".
    pub const INFINITE: Time = Time(u64::MAX);

    pub fn from_millis(ms: u64) -> Time {
        Time(ms)
    }

    pub fn from_secs(secs: u64) -> Time {
        Time(secs.saturating_mul(1000))
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    /// Seconds since the clock origin, truncated to the 32-bit wire form used
    /// by long packet IDs.
    pub fn as_secs32(self) -> u32 {
        (self.0 / 1000) as u32
    }

    pub fn is_infinite(self) -> bool {
        self == Time::INFINITE
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Time) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, d: Duration) -> Time {
        if self.is_infinite() {
            return Time::INFINITE;
        }
        let ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Time(self.0.saturating_add(ms))
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        self.since(rhs)
    }
}

/// Duration value used for "disabled" timers.
pub const DUR_INFINITE: Duration = Duration::from_secs(u64::MAX);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_since() {
        let t = Time::from_secs(10);
        let u = t + Duration::from_millis(2500);
        assert_eq!(u.millis(), 12_500);
        assert_eq!(u.since(t), Duration::from_millis(2500));
        assert_eq!(t.since(u), Duration::ZERO);
        assert_eq!(u.as_secs32(), 12);
    }

    #[test]
    fn infinite_saturates() {
        assert!(Time::INFINITE + Duration::from_secs(1) == Time::INFINITE);
        assert!((Time::from_secs(1) + DUR_INFINITE).is_infinite());
        assert!(Time::ZERO < Time::INFINITE);
    }
}
