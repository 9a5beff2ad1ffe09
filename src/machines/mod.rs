// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain machines and the solve loop.
//!
//! A [`GainMachine`] owns gain solutions for one data chunk and knows how
//! to iterate them against observed and model visibilities. Two
//! implementations exist: [`IntervalGains`] (a single Jones term) and
//! [`JonesChain`] (an ordered product of terms presenting the same
//! interface, so callers cannot tell a chain from a single term).

pub(crate) mod chain;
pub(crate) mod term;

pub use chain::JonesChain;
pub use term::IntervalGains;

use log::debug;
use marlu::Jones;
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::{
    flagging::GainFlags,
    intervals::equations_per_slot,
    params::{ChainParams, ConfigError},
    solutions::SolutionMap,
    ChunkDims, ModelData, VisData,
};

/// Where a term (or chain) is in its solving lifecycle.
///
/// `Converged` and `Stalled` are terminal for active solving, but a
/// machine in either state can still apply its gains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermState {
    Iterating,
    Converged,
    Stalled,
}

/// The capability set shared by a single Jones term and a chain of them.
pub trait GainMachine {
    /// One Gauss-Newton iteration: build the normal equations for the
    /// active term and apply a damped update. Returns the number of flags
    /// raised.
    fn compute_update(&mut self, observed: &VisData, model: &ModelData) -> usize;

    /// `observed − G M Gᴴ` with all gains applied to the model, written
    /// into `residual`.
    fn compute_residual(&mut self, observed: &VisData, model: &ModelData, residual: &mut VisData);

    /// Multiply the current gains onto a model-shaped tensor in place.
    fn apply_gains(&self, model: &mut ModelData);

    /// Apply inverted gains to a visibility-shaped tensor (data
    /// correction). Returns the number of flags raised; flagged cells
    /// never contribute non-finite values.
    fn apply_inv_gains(&mut self, vis: &VisData, corrected: &mut VisData) -> usize;

    /// Project the solution back onto its allowed subspace (reference
    /// antenna gauge, fixed directions). Idempotent.
    fn restrict_solution(&mut self);

    /// Post-update sweep flagging null, non-finite or out-of-bounds
    /// solutions. Returns the number of flags raised.
    fn flag_solutions(&mut self) -> usize;

    /// Digest the equation counts per time/frequency slot, flagging
    /// intervals below the minimum-equation quorum.
    fn update_stats(&mut self, eqs_per_slot: ArrayView2<usize>);

    /// Update converged/stalled bookkeeping from the magnitude of the
    /// last gain update.
    fn update_conv_params(&mut self);

    /// Advance iteration counters, rotating the active term if needed.
    fn next_iteration(&mut self);

    /// The active term's iteration count.
    fn iters(&self) -> u32;

    fn has_converged(&self) -> bool;

    fn has_stalled(&self) -> bool;

    fn state(&self) -> TermState;

    /// Largest relative gain update seen in the last iteration.
    fn max_update(&self) -> f64;

    /// Converged solution cells in the active term.
    fn num_converged(&self) -> usize;

    /// Solvable solution cells in the active term.
    fn num_solutions(&self) -> usize;

    /// The active term's gains.
    fn gains(&self) -> ArrayView4<'_, Jones<f64>>;

    /// The active term's gain flags.
    fn gain_flags(&self) -> ArrayView4<'_, GainFlags>;

    /// Total gain cells currently flagged in the active term.
    fn num_flagged(&self) -> usize {
        self.gain_flags().iter().filter(|f| f.is_set()).count()
    }

    /// Export all terms' solutions keyed by `"<label>:<quantity>"`.
    fn export_solutions(&self) -> SolutionMap;

    /// Warm-start matching terms from an exported mapping; unmatched
    /// terms keep their identity initialisation.
    fn import_solutions(&mut self, solutions: &SolutionMap);
}

/// The outcome of [`solve`] on one chunk.
#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    /// Outer iterations actually performed.
    pub iterations: u32,
    pub converged: bool,
    pub stalled: bool,
    /// Largest relative gain update at the final iteration.
    pub max_update: f64,
    /// Total flags raised across all iterations.
    pub flag_count: usize,
}

/// Iterate a gain machine against one chunk of data until global
/// convergence, global stall, or `max_iter` outer iterations.
///
/// `data_flags` has shape `(n_tim, n_fre, n_ant, n_ant)`, `true` marking
/// flagged samples. Iteration is strictly sequential; parallelism belongs
/// at the chunk level (see [`solve_chunks`]).
pub fn solve(
    machine: &mut dyn GainMachine,
    observed: &VisData,
    model: &ModelData,
    data_flags: Option<ArrayView4<bool>>,
    max_iter: u32,
) -> SolveReport {
    let dims = ChunkDims::from_model(model);
    let eqs = equations_per_slot(dims.n_tim, dims.n_fre, dims.n_ant, dims.n_mod, data_flags);
    machine.update_stats(eqs.view());

    let mut flag_count = 0;
    let mut iterations = 0;
    while iterations < max_iter {
        machine.next_iteration();
        iterations += 1;
        flag_count += machine.compute_update(observed, model);
        flag_count += machine.flag_solutions();
        machine.update_conv_params();
        debug!(
            "iteration {iterations}: max update {:.3e}, {}/{} cells converged, {} flagged",
            machine.max_update(),
            machine.num_converged(),
            machine.num_solutions(),
            machine.num_flagged(),
        );
        if machine.has_converged() || machine.has_stalled() {
            break;
        }
    }

    SolveReport {
        iterations,
        converged: machine.has_converged(),
        stalled: machine.has_stalled(),
        max_update: machine.max_update(),
        flag_count,
    }
}

/// One independently solvable unit of the dataset.
pub struct Chunk {
    pub observed: VisData,
    pub model: ModelData,
    /// Per-sample data flags, `(n_tim, n_fre, n_ant, n_ant)`.
    pub data_flags: Option<Array4<bool>>,
}

/// Everything [`solve_chunks`] produces for one chunk.
pub struct ChunkSolution {
    pub solutions: SolutionMap,
    pub report: SolveReport,
    /// `observed − G M Gᴴ` with the final gains.
    pub residual: VisData,
    /// The residual with the direction-independent gains un-applied.
    pub corrected: VisData,
}

/// Solve many chunks in parallel, one freshly constructed [`JonesChain`]
/// per chunk. Chunks share nothing but the read-only configuration and
/// optional warm start, so they fan out over the rayon thread pool.
pub fn solve_chunks(
    params: &ChainParams,
    chunks: &[Chunk],
    warm_start: Option<&SolutionMap>,
    max_iter: u32,
) -> Result<Vec<ChunkSolution>, ConfigError> {
    chunks
        .par_iter()
        .map(|chunk| {
            let dims = ChunkDims::from_model(&chunk.model);
            let mut machine = JonesChain::new(params, dims)?;
            if let Some(warm) = warm_start {
                machine.import_solutions(warm);
            }
            let report = solve(
                &mut machine,
                &chunk.observed,
                &chunk.model,
                chunk.data_flags.as_ref().map(|f| f.view()),
                max_iter,
            );
            let mut residual = chunk.observed.clone();
            machine.compute_residual(&chunk.observed, &chunk.model, &mut residual);
            let mut corrected = residual.clone();
            machine.apply_inv_gains(&residual, &mut corrected);
            Ok(ChunkSolution {
                solutions: machine.export_solutions(),
                report,
                residual,
                corrected,
            })
        })
        .collect()
}
