// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Exported gain solutions.
//!
//! Solutions leave a machine as a flat mapping from a namespaced key
//! (`"<term-label>:<quantity>"`) to a gain array plus the interval-grid
//! description it was solved on. The same mapping is accepted back by
//! `import_solutions` as a warm start, possibly produced by an earlier
//! pass or a different chunk; entries only import into a machine whose
//! grid spec matches exactly, so interval semantics round-trip unchanged.

use indexmap::IndexMap;

use crate::{GainArray, IntervalGridSpec};

/// The quantity name under which every term exports its gains.
pub const GAIN_QUANTITY: &str = "gain";

/// One exported solution: the values and the grid they were solved on.
#[derive(Debug, Clone)]
pub struct SolutionEntry {
    pub values: GainArray,
    pub grid: IntervalGridSpec,
}

/// Mapping from `"<term-label>:<quantity>"` to solutions, in term order.
pub type SolutionMap = IndexMap<String, SolutionEntry>;

/// Build the namespaced key for a term's quantity.
pub fn solution_key(label: &str, quantity: &str) -> String {
    format!("{label}:{quantity}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_label() {
        assert_eq!(solution_key("G", GAIN_QUANTITY), "G:gain");
        assert_eq!(solution_key("dE", GAIN_QUANTITY), "dE:gain");
    }
}
