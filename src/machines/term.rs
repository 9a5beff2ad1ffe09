// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A single Jones term solved per solution interval.

use log::warn;
use marlu::{c64, Jones};
use ndarray::{azip, prelude::*};

use super::{GainMachine, TermState};
use crate::{
    flagging::GainFlags,
    intervals::IntervalGrid,
    kernels,
    params::{ConfigError, TermParams, TermVariant},
    solutions::{solution_key, SolutionEntry, SolutionMap, GAIN_QUANTITY},
    ChunkDims, FlagArray, GainArray, ModelData, VisData,
};

/// One Jones term's gains, flags and convergence state over one chunk.
///
/// The gain tensor has shape `(n_dir or 1, n_tint, n_fint, n_ant)`; a
/// direction-independent term carries a single broadcast direction. All
/// buffers (including iteration scratch) are allocated at construction
/// and reused across iterations.
pub struct IntervalGains {
    label: String,
    variant: TermVariant,
    dd_term: bool,
    solvable: bool,
    dims: ChunkDims,
    /// Length of the gain array's direction axis.
    n_dir_g: usize,
    grid: IntervalGrid,
    ref_ant: Option<usize>,
    fix_directions: Vec<usize>,
    eps: f64,
    delta_g: f64,
    conv_quorum: f64,
    min_equations: usize,
    term_iters: u32,
    stall_patience: u32,
    clip_low: Option<f64>,
    clip_high: Option<f64>,

    gains: GainArray,
    old_gains: GainArray,
    gflags: FlagArray,
    /// Phase parameters, `(n_dir_g, n_tint, n_fint, n_ant, 2)`; only for
    /// the phase-only variant.
    phases: Option<Array5<f64>>,

    // Scratch buffers.
    jh: Array6<Jones<f64>>,
    jhr_full: Array4<Jones<f64>>,
    jhr_int: Array4<Jones<f64>>,
    jhj: Array4<Jones<f64>>,
    jhjinv: Array4<Jones<f64>>,
    update: Array4<Jones<f64>>,
    ginv: Array4<Jones<f64>>,
    model_scratch: Array6<Jones<f64>>,
    resid_scratch: Array5<Jones<f64>>,

    // Convergence bookkeeping.
    iters: u32,
    eqs_per_interval: Array2<usize>,
    num_valid_intervals: usize,
    n_sols: usize,
    n_cnvgd: usize,
    max_update: f64,
    best_update: f64,
    stall_count: u32,
    converged: bool,
    stalled: bool,
}

impl IntervalGains {
    pub fn new(params: &TermParams, dims: ChunkDims) -> Result<IntervalGains, ConfigError> {
        params.validate(&dims)?;

        let n_dir_g = if params.dd_term { dims.n_dir } else { 1 };
        let grid = IntervalGrid::new(
            dims.n_tim,
            dims.n_fre,
            params.time_interval,
            params.freq_interval,
        );
        let (nti, nfi) = (grid.n_t_ints(), grid.n_f_ints());
        let gain_shape = (n_dir_g, nti, nfi, dims.n_ant);

        let phases = match params.variant {
            TermVariant::PhaseOnly => {
                Some(Array5::zeros((n_dir_g, nti, nfi, dims.n_ant, 2)))
            }
            TermVariant::Complex2x2 | TermVariant::ComplexDiag => None,
        };

        let mut term = IntervalGains {
            label: params.label.clone(),
            variant: params.variant,
            dd_term: params.dd_term,
            solvable: params.solvable,
            dims,
            n_dir_g,
            grid,
            ref_ant: params.ref_ant,
            fix_directions: params.fix_directions.clone(),
            eps: params.eps,
            delta_g: params.delta_g,
            conv_quorum: params.conv_quorum,
            min_equations: params.min_equations,
            term_iters: params.term_iters,
            stall_patience: params.stall_patience,
            clip_low: params.clip_low,
            clip_high: params.clip_high,

            gains: Array4::from_elem(gain_shape, Jones::identity()),
            old_gains: Array4::from_elem(gain_shape, Jones::identity()),
            gflags: Array4::from_elem(gain_shape, GainFlags::NONE),
            phases,

            jh: Array6::from_elem(
                (n_dir_g, dims.n_mod, dims.n_tim, dims.n_fre, dims.n_ant, dims.n_ant),
                Jones::default(),
            ),
            jhr_full: Array4::from_elem(
                (n_dir_g, dims.n_tim, dims.n_fre, dims.n_ant),
                Jones::default(),
            ),
            jhr_int: Array4::from_elem(gain_shape, Jones::default()),
            jhj: Array4::from_elem(gain_shape, Jones::default()),
            jhjinv: Array4::from_elem(gain_shape, Jones::default()),
            update: Array4::from_elem(gain_shape, Jones::default()),
            ginv: Array4::from_elem(gain_shape, Jones::default()),
            model_scratch: Array6::from_elem(
                (dims.n_dir, dims.n_mod, dims.n_tim, dims.n_fre, dims.n_ant, dims.n_ant),
                Jones::default(),
            ),
            resid_scratch: Array5::from_elem(
                (dims.n_mod, dims.n_tim, dims.n_fre, dims.n_ant, dims.n_ant),
                Jones::default(),
            ),

            iters: 0,
            eqs_per_interval: Array2::zeros((nti, nfi)),
            num_valid_intervals: nti * nfi,
            n_sols: n_dir_g * nti * nfi,
            n_cnvgd: 0,
            max_update: f64::INFINITY,
            best_update: f64::INFINITY,
            stall_count: 0,
            converged: false,
            stalled: false,
        };

        // Until real equation counts arrive, assume all samples present.
        let default_eqs = crate::intervals::equations_per_slot(
            dims.n_tim,
            dims.n_fre,
            dims.n_ant,
            dims.n_mod,
            None,
        );
        term.update_stats_inner(default_eqs.view());
        Ok(term)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn variant(&self) -> TermVariant {
        self.variant
    }

    pub fn dd_term(&self) -> bool {
        self.dd_term
    }

    pub fn grid(&self) -> &IntervalGrid {
        &self.grid
    }

    pub(crate) fn term_iters(&self) -> u32 {
        self.term_iters
    }

    pub(crate) fn solvable(&self) -> bool {
        self.solvable
    }

    pub(crate) fn eps(&self) -> f64 {
        self.eps
    }

    pub fn eqs_per_interval(&self) -> ArrayView2<'_, usize> {
        self.eqs_per_interval.view()
    }

    pub fn num_valid_intervals(&self) -> usize {
        self.num_valid_intervals
    }

    /// Flag a gain cell and force its solution to the invertible
    /// placeholder, keeping the "flagged gains are identity" invariant.
    fn flag_cell(&mut self, idx: [usize; 4], bit: GainFlags) {
        self.gflags[idx] |= bit;
        self.gains[idx] = Jones::identity();
        self.old_gains[idx] = Jones::identity();
        if let Some(phases) = &mut self.phases {
            let [d, ti, fi, p] = idx;
            phases[[d, ti, fi, p, 0]] = 0.0;
            phases[[d, ti, fi, p, 1]] = 0.0;
        }
    }

    /// Build this term's normal equations into the `jhr_int`/`jhj`
    /// scratch buffers.
    fn build_normal_equations(&mut self, observed: &VisData, model: &ModelData) {
        // A direction-independent term sees all sky directions as one
        // combined source.
        if self.n_dir_g == 1 && self.dims.n_dir > 1 {
            let summed = kernels::sum_directions(model.view());
            self.jh.assign(&summed);
        } else {
            self.jh.assign(model);
        }
        kernels::apply_left_gains(self.jh.view_mut(), self.gains.view(), &self.grid);

        // With several solvable directions the update is residual-driven;
        // with one effective direction the observed data drive a
        // replacement update.
        if self.n_dir_g > 1 {
            self.residual_into_scratch(observed, model);
            kernels::compute_jhr(
                self.jh.view(),
                self.resid_scratch.view(),
                self.jhr_full.view_mut(),
            );
        } else {
            kernels::compute_jhr(self.jh.view(), observed.view(), self.jhr_full.view_mut());
        }

        kernels::sum_jhr_intervals(self.jhr_full.view(), &self.grid, self.jhr_int.view_mut());
        kernels::compute_jhj(self.jh.view(), &self.grid, self.jhj.view_mut());
    }

    /// Chain entry point: overwrite the normal-equation scratch buffers
    /// with values accumulated across the whole chain.
    pub(crate) fn set_normal_equations(
        &mut self,
        jhr_int: ArrayView4<Jones<f64>>,
        jhj: ArrayView4<Jones<f64>>,
    ) {
        self.jhr_int.assign(&jhr_int);
        self.jhj.assign(&jhj);
    }

    /// Turn the accumulated normal equations into a damped gain update.
    /// Returns the number of flags raised by the conditioning tests.
    pub(crate) fn implement_update(&mut self) -> usize {
        let flag_count = match self.variant {
            TermVariant::Complex2x2 | TermVariant::ComplexDiag => self.implement_complex_update(),
            TermVariant::PhaseOnly => self.implement_phase_update(),
        };
        self.restrict_solution_inner();
        flag_count
    }

    fn implement_complex_update(&mut self) -> usize {
        let flag_count = kernels::invert_with_flags(
            self.jhj.view(),
            self.eps,
            GainFlags::ILLCOND,
            self.gflags.view_mut(),
            self.jhjinv.view_mut(),
        );
        kernels::compute_update(
            self.jhr_int.view(),
            self.jhjinv.view(),
            self.update.view_mut(),
        );

        let additive = self.dd_term && self.dims.n_dir > 1;
        // Alternate full and half steps to stabilise the Gauss-Newton
        // recursion; direction-dependent terms always take the half step.
        let half = self.iters % 2 == 0 || self.dd_term;

        let (n_dir, nti, nfi, n_ant) = self.gains.dim();
        for d in 0..n_dir {
            for ti in 0..nti {
                for fi in 0..nfi {
                    for p in 0..n_ant {
                        let idx = [d, ti, fi, p];
                        if self.gflags[idx].is_set() {
                            self.gains[idx] = Jones::identity();
                            continue;
                        }
                        let g = self.gains[idx];
                        let mut u = self.update[idx];
                        if additive {
                            u = g + u;
                        }
                        self.gains[idx] = if half { (g + u) * 0.5 } else { u };
                    }
                }
            }
        }
        flag_count
    }

    fn implement_phase_update(&mut self) -> usize {
        let damp = if self.iters % 2 == 0 { 0.5 } else { 1.0 };
        let (n_dir, nti, nfi, n_ant) = self.gains.dim();
        let mut illcond = vec![];
        if let Some(phases) = &mut self.phases {
            for d in 0..n_dir {
                for ti in 0..nti {
                    for fi in 0..nfi {
                        for p in 0..n_ant {
                            let idx = [d, ti, fi, p];
                            if self.gflags[idx].is_set() {
                                continue;
                            }
                            let jj = self.jhj[idx];
                            let (j0, j1) = (jj[0].re, jj[3].re);
                            if j0.abs() < self.eps || j1.abs() < self.eps {
                                illcond.push(idx);
                                continue;
                            }
                            // The phase gradient is the imaginary part of
                            // the diagonal of Gᴴ·JHR.
                            let v = self.gains[idx].h() * self.jhr_int[idx];
                            phases[[d, ti, fi, p, 0]] += damp * v[0].im / j0;
                            phases[[d, ti, fi, p, 1]] += damp * v[3].im / j1;
                        }
                    }
                }
            }
        }
        let flag_count = illcond.len();
        for idx in illcond {
            self.flag_cell(idx, GainFlags::ILLCOND);
        }
        flag_count
    }

    fn restrict_solution_inner(&mut self) {
        match self.variant {
            TermVariant::Complex2x2 | TermVariant::ComplexDiag => {
                if self.variant == TermVariant::ComplexDiag {
                    self.gains.mapv_inplace(|j| {
                        Jones::from([j[0], c64::default(), c64::default(), j[3]])
                    });
                }

                // Fix the phase gauge to the reference antenna.
                if let Some(r) = self.ref_ant {
                    let (n_dir, nti, nfi, n_ant) = self.gains.dim();
                    for d in 0..n_dir {
                        for ti in 0..nti {
                            for fi in 0..nfi {
                                let theta = self.gains[[d, ti, fi, r]][0].arg();
                                let scale = c64::from_polar(1.0, -theta);
                                for p in 0..n_ant {
                                    let g = self.gains[[d, ti, fi, p]];
                                    self.gains[[d, ti, fi, p]] = g * scale;
                                }
                            }
                        }
                    }
                }

                for &d in &self.fix_directions {
                    if d < self.n_dir_g {
                        self.gains
                            .index_axis_mut(Axis(0), d)
                            .assign(&self.old_gains.index_axis(Axis(0), d));
                    }
                }
            }
            TermVariant::PhaseOnly => {
                if let Some(phases) = &mut self.phases {
                    let (n_dir, nti, nfi, n_ant, _) = phases.dim();
                    if let Some(r) = self.ref_ant {
                        for d in 0..n_dir {
                            for ti in 0..nti {
                                for fi in 0..nfi {
                                    for c in 0..2 {
                                        let ref_phase = phases[[d, ti, fi, r, c]];
                                        for p in 0..n_ant {
                                            phases[[d, ti, fi, p, c]] -= ref_phase;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    for &d in &self.fix_directions {
                        if d < n_dir {
                            phases.index_axis_mut(Axis(0), d).fill(0.0);
                        }
                    }
                    // Rebuild the gains from the restricted phases.
                    for d in 0..n_dir {
                        for ti in 0..nti {
                            for fi in 0..nfi {
                                for p in 0..n_ant {
                                    let idx = [d, ti, fi, p];
                                    self.gains[idx] = if self.gflags[idx].is_set() {
                                        Jones::identity()
                                    } else {
                                        Jones::from([
                                            c64::from_polar(1.0, phases[[d, ti, fi, p, 0]]),
                                            c64::default(),
                                            c64::default(),
                                            c64::from_polar(1.0, phases[[d, ti, fi, p, 1]]),
                                        ])
                                    };
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn residual_into_scratch(&mut self, observed: &VisData, model: &ModelData) {
        self.model_scratch.assign(model);
        kernels::apply_gains(self.model_scratch.view_mut(), self.gains.view(), &self.grid);
        self.resid_scratch.assign(observed);
        kernels::subtract_model(self.resid_scratch.view_mut(), self.model_scratch.view());
    }

    fn update_stats_inner(&mut self, eqs_per_slot: ArrayView2<usize>) {
        self.eqs_per_interval.fill(0);
        for t in 0..self.grid.n_tim() {
            let ti = self.grid.t_index(t);
            for f in 0..self.grid.n_fre() {
                let fi = self.grid.f_index(f);
                self.eqs_per_interval[[ti, fi]] += eqs_per_slot[[t, f]];
            }
        }

        let (nti, nfi) = self.eqs_per_interval.dim();
        let mut valid = 0;
        for ti in 0..nti {
            for fi in 0..nfi {
                if self.eqs_per_interval[[ti, fi]] < self.min_equations {
                    for d in 0..self.n_dir_g {
                        for p in 0..self.dims.n_ant {
                            self.flag_cell([d, ti, fi, p], GainFlags::MISSING);
                        }
                    }
                } else {
                    valid += 1;
                }
            }
        }
        self.num_valid_intervals = valid;
        self.n_sols = self.n_dir_g * valid;
    }
}

impl GainMachine for IntervalGains {
    fn compute_update(&mut self, observed: &VisData, model: &ModelData) -> usize {
        if !self.solvable {
            return 0;
        }
        self.build_normal_equations(observed, model);
        self.implement_update()
    }

    fn compute_residual(&mut self, observed: &VisData, model: &ModelData, residual: &mut VisData) {
        self.residual_into_scratch(observed, model);
        residual.assign(&self.resid_scratch);
    }

    fn apply_gains(&self, model: &mut ModelData) {
        kernels::apply_gains(model.view_mut(), self.gains.view(), &self.grid);
    }

    /// For a direction-dependent term only the first direction's gains
    /// are un-applied; a combined residual has no per-direction meaning.
    fn apply_inv_gains(&mut self, vis: &VisData, corrected: &mut VisData) -> usize {
        let flag_count = match self.variant {
            TermVariant::PhaseOnly => {
                // Unit-modulus diagonal gains invert by conjugation and
                // never raise conditioning flags.
                azip!((o in &mut self.ginv, &g in &self.gains) {
                    *o = Jones::from([
                        g[0].conj(),
                        c64::default(),
                        c64::default(),
                        g[3].conj(),
                    ]);
                });
                0
            }
            TermVariant::Complex2x2 | TermVariant::ComplexDiag => kernels::invert_gains(
                self.gains.view(),
                self.eps,
                GainFlags::ILLCOND,
                self.gflags.view_mut(),
                self.ginv.view_mut(),
            ),
        };
        kernels::compute_corrected(
            vis.view(),
            self.ginv.view(),
            &self.grid,
            corrected.view_mut(),
        );
        flag_count
    }

    fn restrict_solution(&mut self) {
        self.restrict_solution_inner();
    }

    fn flag_solutions(&mut self) -> usize {
        let mut newly_flagged = vec![];
        let (n_dir, nti, nfi, n_ant) = self.gains.dim();
        for d in 0..n_dir {
            for ti in 0..nti {
                for fi in 0..nfi {
                    for p in 0..n_ant {
                        let idx = [d, ti, fi, p];
                        if self.gflags[idx].is_set() {
                            continue;
                        }
                        let g = self.gains[idx];
                        if (0..4).any(|i| !g[i].is_finite()) {
                            newly_flagged.push((idx, GainFlags::NULL));
                            continue;
                        }
                        let (a0, a1) = (g[0].norm(), g[3].norm());
                        if a0 == 0.0 && a1 == 0.0 {
                            newly_flagged.push((idx, GainFlags::NULL));
                            continue;
                        }
                        if let Some(hi) = self.clip_high {
                            if a0.max(a1) > hi {
                                newly_flagged.push((idx, GainFlags::BOUNDS));
                                continue;
                            }
                        }
                        if let Some(lo) = self.clip_low {
                            if a0.min(a1) < lo {
                                newly_flagged.push((idx, GainFlags::BOUNDS));
                            }
                        }
                    }
                }
            }
        }
        let count = newly_flagged.len();
        for (idx, bit) in newly_flagged {
            self.flag_cell(idx, bit);
        }
        count
    }

    fn update_stats(&mut self, eqs_per_slot: ArrayView2<usize>) {
        self.update_stats_inner(eqs_per_slot);
    }

    fn update_conv_params(&mut self) {
        if !self.solvable {
            self.converged = true;
            self.max_update = 0.0;
            self.old_gains.assign(&self.gains);
            return;
        }

        let (n_dir, nti, nfi, n_ant) = self.gains.dim();
        let mut n_cnvgd = 0;
        let mut n_cells = 0;
        let mut max_update = 0.0_f64;
        for d in 0..n_dir {
            for ti in 0..nti {
                for fi in 0..nfi {
                    if self.eqs_per_interval[[ti, fi]] < self.min_equations {
                        continue;
                    }
                    n_cells += 1;
                    let mut diff = 0.0;
                    let mut norm = 0.0;
                    for p in 0..n_ant {
                        let g = self.gains[[d, ti, fi, p]];
                        let o = self.old_gains[[d, ti, fi, p]];
                        for i in 0..4 {
                            diff += (g[i] - o[i]).norm_sqr();
                            norm += g[i].norm_sqr();
                        }
                    }
                    if norm <= 0.0 {
                        n_cnvgd += 1;
                        continue;
                    }
                    let rel = (diff / norm).sqrt();
                    max_update = max_update.max(rel);
                    if rel <= self.delta_g {
                        n_cnvgd += 1;
                    }
                }
            }
        }
        self.n_cnvgd = n_cnvgd;
        self.n_sols = n_cells;
        self.max_update = max_update;
        self.old_gains.assign(&self.gains);

        self.converged =
            n_cells == 0 || (n_cnvgd as f64) + 1e-12 >= self.conv_quorum * (n_cells as f64);
        if self.converged {
            self.stall_count = 0;
        } else if max_update < self.best_update {
            self.best_update = max_update;
            self.stall_count = 0;
        } else {
            self.stall_count += 1;
            if self.stall_count >= self.stall_patience {
                self.stalled = true;
            }
        }
    }

    fn next_iteration(&mut self) {
        self.iters += 1;
    }

    fn iters(&self) -> u32 {
        self.iters
    }

    fn has_converged(&self) -> bool {
        self.converged || !self.solvable
    }

    fn has_stalled(&self) -> bool {
        self.stalled
    }

    fn state(&self) -> TermState {
        if self.has_converged() {
            TermState::Converged
        } else if self.stalled {
            TermState::Stalled
        } else {
            TermState::Iterating
        }
    }

    fn max_update(&self) -> f64 {
        self.max_update
    }

    fn num_converged(&self) -> usize {
        self.n_cnvgd
    }

    fn num_solutions(&self) -> usize {
        self.n_sols
    }

    fn gains(&self) -> ArrayView4<'_, Jones<f64>> {
        self.gains.view()
    }

    fn gain_flags(&self) -> ArrayView4<'_, GainFlags> {
        self.gflags.view()
    }

    fn export_solutions(&self) -> SolutionMap {
        let mut solutions = SolutionMap::default();
        solutions.insert(
            solution_key(&self.label, GAIN_QUANTITY),
            SolutionEntry {
                values: self.gains.clone(),
                grid: self.grid.spec(),
            },
        );
        solutions
    }

    fn import_solutions(&mut self, solutions: &SolutionMap) {
        let key = solution_key(&self.label, GAIN_QUANTITY);
        let Some(entry) = solutions.get(&key) else {
            return;
        };
        if entry.grid != self.grid.spec() || entry.values.dim() != self.gains.dim() {
            warn!(
                "'{key}': stored solutions don't match this term's interval grid; ignoring them"
            );
            return;
        }
        self.gains.assign(&entry.values);
        self.old_gains.assign(&entry.values);
        if let Some(phases) = &mut self.phases {
            let (n_dir, nti, nfi, n_ant, _) = phases.dim();
            for d in 0..n_dir {
                for ti in 0..nti {
                    for fi in 0..nfi {
                        for p in 0..n_ant {
                            let g = self.gains[[d, ti, fi, p]];
                            phases[[d, ti, fi, p, 0]] = g[0].arg();
                            phases[[d, ti, fi, p, 1]] = g[3].arg();
                        }
                    }
                }
            }
        }
    }
}
