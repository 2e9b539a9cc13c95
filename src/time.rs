//! Simulation virtual time
//!
//! Time is a signed fixed-point count of nanoseconds of simulated time.
//! The unit is fixed: one tick is 10^-9 seconds. The type carries an
//! additive identity, a smallest representable step, and a maximum
//! sentinel used to mean "no constraint".

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

const NS_PER_SECOND: f64 = 1e9;

/// A point (or span) of simulated time, in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Time(i64);

impl Time {
    /// The additive identity.
    pub const ZERO: Time = Time(0);

    /// The smallest representable forward step (1 ns).
    pub const EPSILON: Time = Time(1);

    /// Sentinel meaning "unbounded"; compares greater than every real time.
    pub const MAX: Time = Time(i64::MAX);

    /// Construct from a raw nanosecond count.
    pub const fn from_ns(ns: i64) -> Self {
        Time(ns)
    }

    /// Construct from a floating-point count of seconds.
    pub fn from_seconds(seconds: f64) -> Self {
        Time((seconds * NS_PER_SECOND) as i64)
    }

    /// The raw nanosecond count.
    pub const fn as_ns(self) -> i64 {
        self.0
    }

    /// The value as floating-point seconds.
    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / NS_PER_SECOND
    }

    /// Saturating addition; `MAX` absorbs.
    pub fn saturating_add(self, rhs: Time) -> Time {
        Time(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    pub fn saturating_sub(self, rhs: Time) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Time::MAX {
            write!(f, "max")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}
