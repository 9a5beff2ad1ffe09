// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Jones-chain gain calibration for radio interferometric visibilities.

Given observed visibilities and per-direction model visibilities for one
data chunk, this crate solves for a chain of per-antenna Jones terms
G₁ G₂ … Gₙ such that G₁ G₂ … Gₙ M Gₙᴴ … G₁ᴴ best matches the data, using
an iterative Gauss-Newton scheme. Each term has its own parameterization
(full 2x2 complex, diagonal complex, or diagonal phase-only), its own
time/frequency solution intervals, and its own convergence and flag state.

Visibilities are stored as `ndarray` tensors of `marlu::Jones` blocks; the
two correlation axes of the underlying data live inside each 2x2 block.
*/

pub mod flagging;
pub mod intervals;
pub mod kernels;
pub mod machines;
pub mod params;
pub mod solutions;

use marlu::Jones;
use ndarray::prelude::*;

pub use flagging::GainFlags;
pub use intervals::{IntervalGrid, IntervalGridSpec};
pub use machines::{
    solve, solve_chunks, Chunk, ChunkSolution, GainMachine, IntervalGains, JonesChain, SolveReport,
    TermState,
};
pub use params::{ChainParams, ConfigError, TermParams, TermVariant};
pub use solutions::{SolutionEntry, SolutionMap};

/// Observed visibilities: `(n_mod, n_tim, n_fre, n_ant, n_ant)` of 2x2
/// correlation blocks. The antenna axes hold the full cross-correlation
/// matrix, i.e. `vis[.., p, q] == vis[.., q, p].h()` off the diagonal.
pub type VisData = Array5<Jones<f64>>;

/// Model visibilities: `(n_dir, n_mod, n_tim, n_fre, n_ant, n_ant)`, one
/// slab per sky-model direction.
pub type ModelData = Array6<Jones<f64>>;

/// Per-term gain solutions: `(n_dir or 1, n_tint, n_fint, n_ant)`.
pub type GainArray = Array4<Jones<f64>>;

/// Gain flags, parallel to [`GainArray`].
pub type FlagArray = Array4<GainFlags>;

/// The axis lengths of one data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDims {
    pub n_dir: usize,
    pub n_mod: usize,
    pub n_tim: usize,
    pub n_fre: usize,
    pub n_ant: usize,
}

impl ChunkDims {
    pub fn from_model(model: &ModelData) -> ChunkDims {
        let (n_dir, n_mod, n_tim, n_fre, n_ant, _) = model.dim();
        ChunkDims {
            n_dir,
            n_mod,
            n_tim,
            n_fre,
            n_ant,
        }
    }
}
