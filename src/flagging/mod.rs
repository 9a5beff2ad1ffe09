// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain-flag bitmask.
//!
//! Every gain cell (direction, time interval, freq interval, antenna)
//! carries a bitmask recording why its solution is invalid. A flagged
//! cell's gain is always forced to identity so that downstream
//! multiplication never propagates non-finite values; the bits are
//! informational, never fatal.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Reasons a gain solution can be invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GainFlags(u16);

impl GainFlags {
    /// No flags raised.
    pub const NONE: GainFlags = GainFlags(0);
    /// Too few equations in the solution interval.
    pub const MISSING: GainFlags = GainFlags(1 << 0);
    /// Normal-equation matrix was singular or ill-conditioned.
    pub const ILLCOND: GainFlags = GainFlags(1 << 1);
    /// Gain collapsed to null or a non-finite value.
    pub const NULL: GainFlags = GainFlags(1 << 2);
    /// Gain amplitude fell outside the configured bounds.
    pub const BOUNDS: GainFlags = GainFlags(1 << 3);

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, other: GainFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for GainFlags {
    type Output = GainFlags;

    fn bitor(self, rhs: GainFlags) -> GainFlags {
        GainFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for GainFlags {
    fn bitor_assign(&mut self, rhs: GainFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for GainFlags {
    type Output = GainFlags;

    fn bitand(self, rhs: GainFlags) -> GainFlags {
        GainFlags(self.0 & rhs.0)
    }
}

impl fmt::Display for GainFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.is_set() {
            return write!(f, "ok");
        }
        let mut first = true;
        for (bit, name) in [
            (GainFlags::MISSING, "missing"),
            (GainFlags::ILLCOND, "illcond"),
            (GainFlags::NULL, "null"),
            (GainFlags::BOUNDS, "bounds"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}
