// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Solution intervals.
//!
//! A gain term is not solved per visibility sample but per block of
//! contiguous time/frequency samples (an "interval"), trading resolution
//! for signal-to-noise. [`IntervalGrid`] maps sample indices to interval
//! indices; every sample maps to exactly one interval and intervals are
//! contiguous and non-overlapping. The trailing interval on each axis may
//! be ragged (fewer samples than the configured width).

#[cfg(test)]
mod tests;

use ndarray::prelude::*;

/// The interval layout of one term over one data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGrid {
    n_tim: usize,
    n_fre: usize,
    t_int: usize,
    f_int: usize,
}

impl IntervalGrid {
    /// Create a grid over `n_tim` x `n_fre` samples with the given interval
    /// widths. Widths are clamped to at least one sample; callers validate
    /// zero widths as configuration errors before getting here.
    pub fn new(n_tim: usize, n_fre: usize, t_int: usize, f_int: usize) -> IntervalGrid {
        IntervalGrid {
            n_tim,
            n_fre,
            t_int: t_int.max(1),
            f_int: f_int.max(1),
        }
    }

    pub fn n_tim(&self) -> usize {
        self.n_tim
    }

    pub fn n_fre(&self) -> usize {
        self.n_fre
    }

    /// Number of time intervals.
    pub fn n_t_ints(&self) -> usize {
        self.n_tim.div_ceil(self.t_int)
    }

    /// Number of frequency intervals.
    pub fn n_f_ints(&self) -> usize {
        self.n_fre.div_ceil(self.f_int)
    }

    /// The time interval that time sample `t` belongs to.
    pub fn t_index(&self, t: usize) -> usize {
        t / self.t_int
    }

    /// The frequency interval that channel `f` belongs to.
    pub fn f_index(&self, f: usize) -> usize {
        f / self.f_int
    }

    /// A serializable description of this grid, compared on solution import.
    pub fn spec(&self) -> IntervalGridSpec {
        IntervalGridSpec {
            n_tim: self.n_tim,
            n_fre: self.n_fre,
            t_int: self.t_int,
            f_int: self.f_int,
        }
    }
}

/// Describes an [`IntervalGrid`] in an exported-solution mapping. Solutions
/// only import into a machine whose grid spec is identical, so interval
/// semantics round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGridSpec {
    pub n_tim: usize,
    pub n_fre: usize,
    pub t_int: usize,
    pub f_int: usize,
}

impl IntervalGridSpec {
    pub fn grid(&self) -> IntervalGrid {
        IntervalGrid::new(self.n_tim, self.n_fre, self.t_int, self.f_int)
    }
}

/// Count the real-valued equations available in each time/frequency slot.
///
/// Each unflagged cross-correlation (baseline) sample is a 2x2 complex
/// block, contributing 8 real equations per model. `data_flags` has shape
/// `(n_tim, n_fre, n_ant, n_ant)` with `true` marking flagged samples;
/// `None` means all samples are present.
pub fn equations_per_slot(
    n_tim: usize,
    n_fre: usize,
    n_ant: usize,
    n_mod: usize,
    data_flags: Option<ArrayView4<bool>>,
) -> Array2<usize> {
    let mut eqs = Array2::zeros((n_tim, n_fre));
    for t in 0..n_tim {
        for f in 0..n_fre {
            let mut count = 0;
            for p in 0..n_ant {
                for q in (p + 1)..n_ant {
                    let flagged = data_flags.map(|fl| fl[[t, f, p, q]]).unwrap_or(false);
                    if !flagged {
                        count += 8 * n_mod;
                    }
                }
            }
            eqs[[t, f]] = count;
        }
    }
    eqs
}
