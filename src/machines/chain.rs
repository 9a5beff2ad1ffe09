// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A chain of Jones terms solved by round-robin term rotation.

use marlu::Jones;
use ndarray::prelude::*;
use vec1::Vec1;

use super::{GainMachine, IntervalGains, TermState};
use crate::{
    flagging::GainFlags,
    kernels,
    params::{ChainParams, ConfigError},
    solutions::SolutionMap,
    ChunkDims, ModelData, VisData,
};

/// An ordered product of Jones terms, `G₁ G₂ … Gₙ M Gₙᴴ … G₁ᴴ`, solved
/// one term at a time.
///
/// Exactly one term is *active*; updates are computed for it while every
/// other term is held fixed, and [`next_iteration`] rotates the active
/// slot once a term has used its iteration quota, converged or stalled.
/// Terms after the active one only enter the normal equations through
/// their effect on the model, so that product is cached and refreshed
/// only when the active slot moves.
///
/// A chain presents the same [`GainMachine`] face as a single term; the
/// per-term methods (`gains`, `max_update`, ...) report on the active
/// term.
///
/// [`next_iteration`]: GainMachine::next_iteration
pub struct JonesChain {
    dims: ChunkDims,
    terms: Vec1<IntervalGains>,
    active_index: usize,
    last_active_index: Option<usize>,
    /// The active term's iteration count when it last became active; the
    /// difference to its current count is the quota spent this visit.
    activation_iters: u32,

    /// Model with all terms after the active one applied, summed over
    /// directions when the active term is direction-independent.
    /// Reallocated on rotation since its shape follows the active term.
    cached_model: ModelData,
    jh: Array6<Jones<f64>>,
    jhr_full: Array4<Jones<f64>>,
    jhr_int: Array4<Jones<f64>>,
    jhj: Array4<Jones<f64>>,
    model_scratch: Array6<Jones<f64>>,
    resid_scratch: Array5<Jones<f64>>,
    vis_scratch: Array5<Jones<f64>>,
}

impl JonesChain {
    pub fn new(params: &ChainParams, dims: ChunkDims) -> Result<JonesChain, ConfigError> {
        params.validate(&dims)?;
        let terms = params
            .terms
            .iter()
            .map(|t| IntervalGains::new(t, dims))
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let terms = Vec1::try_from_vec(terms).map_err(|_| ConfigError::EmptyChain)?;
        let active_index = terms.iter().position(|t| t.solvable()).unwrap_or(0);

        let vis_shape = (dims.n_mod, dims.n_tim, dims.n_fre, dims.n_ant, dims.n_ant);
        let empty6 = Array6::from_elem((0, 0, 0, 0, 0, 0), Jones::default());
        let empty4 = Array4::from_elem((0, 0, 0, 0), Jones::default());
        Ok(JonesChain {
            dims,
            terms,
            active_index,
            last_active_index: None,
            activation_iters: 0,
            cached_model: empty6.clone(),
            jh: empty6,
            jhr_full: empty4.clone(),
            jhr_int: empty4.clone(),
            jhj: empty4,
            model_scratch: Array6::from_elem(
                (
                    dims.n_dir,
                    dims.n_mod,
                    dims.n_tim,
                    dims.n_fre,
                    dims.n_ant,
                    dims.n_ant,
                ),
                Jones::default(),
            ),
            resid_scratch: Array5::from_elem(vis_shape, Jones::default()),
            vis_scratch: Array5::from_elem(vis_shape, Jones::default()),
        })
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn active_label(&self) -> &str {
        self.terms[self.active_index].label()
    }

    pub fn term(&self, index: usize) -> &IntervalGains {
        &self.terms[index]
    }

    /// Rebuild the cached downstream-model product for the current active
    /// term.
    fn refresh_cache(&mut self, model: &ModelData) {
        let active = self.active_index;
        let n_dir_g = self.terms[active].gains().len_of(Axis(0));

        let mut cached = model.clone();
        for ind in (active + 1..self.terms.len()).rev() {
            kernels::apply_gains(
                cached.view_mut(),
                self.terms[ind].gains(),
                self.terms[ind].grid(),
            );
        }
        if n_dir_g == 1 && self.dims.n_dir > 1 {
            cached = kernels::sum_directions(cached.view());
        }

        if self.jh.dim() != cached.dim() {
            self.jh = Array6::from_elem(cached.dim(), Jones::default());
            self.jhr_full = Array4::from_elem(
                (
                    cached.len_of(Axis(0)),
                    self.dims.n_tim,
                    self.dims.n_fre,
                    self.dims.n_ant,
                ),
                Jones::default(),
            );
        }
        let gain_shape = self.terms[active].gains().dim();
        if self.jhr_int.dim() != gain_shape {
            self.jhr_int = Array4::from_elem(gain_shape, Jones::default());
            self.jhj = Array4::from_elem(gain_shape, Jones::default());
        }

        self.cached_model = cached;
        self.last_active_index = Some(active);
    }

    fn residual_into_scratch(&mut self, observed: &VisData, model: &ModelData) {
        self.model_scratch.assign(model);
        for ind in (0..self.terms.len()).rev() {
            kernels::apply_gains(
                self.model_scratch.view_mut(),
                self.terms[ind].gains(),
                self.terms[ind].grid(),
            );
        }
        self.resid_scratch.assign(observed);
        kernels::subtract_model(self.resid_scratch.view_mut(), self.model_scratch.view());
    }
}

impl GainMachine for JonesChain {
    fn compute_update(&mut self, observed: &VisData, model: &ModelData) -> usize {
        let active = self.active_index;
        if !self.terms[active].solvable() {
            return 0;
        }
        // The cache goes stale when the active slot moves and on the first
        // iteration of a visit (imported or earlier-solved gains may have
        // changed the downstream product).
        if self.last_active_index != Some(active) || self.terms[active].iters() == 1 {
            self.refresh_cache(model);
        }

        // J = G₀ … G_active · (cached model); innermost term first.
        self.jh.assign(&self.cached_model);
        for ind in (0..=active).rev() {
            kernels::apply_left_gains(
                self.jh.view_mut(),
                self.terms[ind].gains(),
                self.terms[ind].grid(),
            );
        }

        let n_dir_g = self.terms[active].gains().len_of(Axis(0));
        if n_dir_g > 1 {
            self.residual_into_scratch(observed, model);
            kernels::compute_jhr(
                self.jh.view(),
                self.resid_scratch.view(),
                self.jhr_full.view_mut(),
            );
        } else {
            kernels::compute_jhr(self.jh.view(), observed.view(), self.jhr_full.view_mut());
        }

        // Project JHR through the inverses of the terms to the left of the
        // active one. Inversion failures of held terms shouldn't leave
        // marks on their solutions, so the flags are scratch copies.
        for ind in 0..active {
            let term = &self.terms[ind];
            let mut scratch_flags = term.gain_flags().to_owned();
            let mut ginv = Array4::from_elem(term.gains().dim(), Jones::identity());
            kernels::invert_gains(
                term.gains(),
                term.eps(),
                GainFlags::ILLCOND,
                scratch_flags.view_mut(),
                ginv.view_mut(),
            );
            kernels::apply_left_inv(self.jhr_full.view_mut(), ginv.view(), term.grid());
        }

        kernels::sum_jhr_intervals(
            self.jhr_full.view(),
            self.terms[active].grid(),
            self.jhr_int.view_mut(),
        );
        kernels::compute_jhj(self.jh.view(), self.terms[active].grid(), self.jhj.view_mut());

        self.terms[active].set_normal_equations(self.jhr_int.view(), self.jhj.view());
        self.terms[active].implement_update()
    }

    fn compute_residual(&mut self, observed: &VisData, model: &ModelData, residual: &mut VisData) {
        self.residual_into_scratch(observed, model);
        residual.assign(&self.resid_scratch);
    }

    fn apply_gains(&self, model: &mut ModelData) {
        for ind in (0..self.terms.len()).rev() {
            kernels::apply_gains(
                model.view_mut(),
                self.terms[ind].gains(),
                self.terms[ind].grid(),
            );
        }
    }

    /// Un-applies terms left to right, stopping at the first
    /// direction-dependent term: a combined visibility can't be corrected
    /// by per-direction gains.
    fn apply_inv_gains(&mut self, vis: &VisData, corrected: &mut VisData) -> usize {
        corrected.assign(vis);
        let mut flag_count = 0;
        for ind in 0..self.terms.len() {
            if self.terms[ind].dd_term() {
                break;
            }
            self.vis_scratch.assign(corrected);
            flag_count += self.terms[ind].apply_inv_gains(&self.vis_scratch, corrected);
        }
        flag_count
    }

    fn restrict_solution(&mut self) {
        self.terms[self.active_index].restrict_solution();
    }

    fn flag_solutions(&mut self) -> usize {
        self.terms[self.active_index].flag_solutions()
    }

    fn update_stats(&mut self, eqs_per_slot: ArrayView2<usize>) {
        for term in self.terms.iter_mut() {
            term.update_stats(eqs_per_slot);
        }
    }

    fn update_conv_params(&mut self) {
        self.terms[self.active_index].update_conv_params();
    }

    /// Advance the active term's iteration count, first rotating the
    /// active slot if the term has spent its per-visit quota, converged or
    /// stalled. The search for the next candidate is bounded by one full
    /// cycle; when every other term is finished the active slot stays put
    /// and the chain reports converged or stalled instead.
    fn next_iteration(&mut self) {
        let n = self.terms.len();
        let active = &self.terms[self.active_index];
        let quota_spent =
            active.iters().saturating_sub(self.activation_iters) >= active.term_iters();
        if quota_spent || active.has_converged() || active.has_stalled() {
            for step in 1..=n {
                let cand = (self.active_index + step) % n;
                let t = &self.terms[cand];
                if t.solvable() && !t.has_converged() && !t.has_stalled() {
                    self.active_index = cand;
                    self.activation_iters = t.iters();
                    break;
                }
            }
        }
        self.terms[self.active_index].next_iteration();
    }

    fn iters(&self) -> u32 {
        self.terms[self.active_index].iters()
    }

    fn has_converged(&self) -> bool {
        self.terms.iter().all(|t| t.has_converged())
    }

    /// A chain stalls when no term can take another useful iteration:
    /// every term is converged or stalled, and at least one is stalled.
    fn has_stalled(&self) -> bool {
        !self.has_converged()
            && self
                .terms
                .iter()
                .all(|t| t.has_converged() || t.has_stalled())
    }

    fn state(&self) -> TermState {
        if self.has_converged() {
            TermState::Converged
        } else if self.has_stalled() {
            TermState::Stalled
        } else {
            TermState::Iterating
        }
    }

    fn max_update(&self) -> f64 {
        self.terms[self.active_index].max_update()
    }

    fn num_converged(&self) -> usize {
        self.terms[self.active_index].num_converged()
    }

    fn num_solutions(&self) -> usize {
        self.terms[self.active_index].num_solutions()
    }

    fn gains(&self) -> ArrayView4<'_, Jones<f64>> {
        self.terms[self.active_index].gains()
    }

    fn gain_flags(&self) -> ArrayView4<'_, GainFlags> {
        self.terms[self.active_index].gain_flags()
    }

    fn export_solutions(&self) -> SolutionMap {
        let mut solutions = SolutionMap::default();
        for term in self.terms.iter() {
            solutions.extend(term.export_solutions());
        }
        solutions
    }

    fn import_solutions(&mut self, solutions: &SolutionMap) {
        for term in self.terms.iter_mut() {
            term.import_solutions(solutions);
        }
    }
}
