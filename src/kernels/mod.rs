// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Primitive tensor kernels.
//!
//! Everything a gain machine does numerically bottoms out here: gain
//! application, Jacobian ("JH") transforms, JHR/JHJ accumulation, interval
//! summation, conditioned 2x2 inversion, residual subtraction. All kernels
//! are pure and write into caller-supplied buffers, so machines control
//! every allocation; none of them hold state, so they are trivially
//! reentrant across concurrent chunk solves.
//!
//! Dimension conventions (see the crate docs): visibility-shaped tensors
//! are `(n_mod, n_tim, n_fre, n_ant, n_ant)`, model/Jacobian tensors add a
//! leading direction axis, gain-shaped tensors are
//! `(n_dir or 1, n_tint, n_fint, n_ant)`. A gain array with a direction
//! axis of length 1 broadcasts over all model directions.

#[cfg(test)]
mod tests;

use marlu::Jones;
use ndarray::{azip, prelude::*};
use num_complex::Complex;

use crate::{flagging::GainFlags, intervals::IntervalGrid};

/// Invert a 2x2 complex matrix, declaring failure when the determinant
/// magnitude is below `eps` or non-finite. Never returns a matrix with
/// NaN/Inf entries.
pub fn inv2x2(j: Jones<f64>, eps: f64) -> Option<Jones<f64>> {
    let det: Complex<f64> = j[0] * j[3] - j[1] * j[2];
    if !det.is_finite() || det.norm() < eps {
        None
    } else {
        Some(j.inv())
    }
}

/// Index into the (broadcastable) direction axis of a gain array.
#[inline]
fn dir_index(gains: &ArrayView4<Jones<f64>>, d: usize) -> usize {
    if gains.len_of(Axis(0)) == 1 {
        0
    } else {
        d
    }
}

/// One chain link of the Jacobian transform: left-multiply a term's gains
/// into a model-shaped tensor, `jh[d,m,t,f,p,q] = G[d,p] · jh[d,m,t,f,p,q]`,
/// with the gains looked up at the term's interval resolution.
pub fn apply_left_gains(
    mut jh: ArrayViewMut6<Jones<f64>>,
    gains: ArrayView4<Jones<f64>>,
    grid: &IntervalGrid,
) {
    let (n_dir, n_mod, n_tim, n_fre, n_ant, _) = jh.dim();
    for d in 0..n_dir {
        let dg = dir_index(&gains, d);
        for m in 0..n_mod {
            for t in 0..n_tim {
                let ti = grid.t_index(t);
                for f in 0..n_fre {
                    let fi = grid.f_index(f);
                    for p in 0..n_ant {
                        let g = gains[[dg, ti, fi, p]];
                        for q in 0..n_ant {
                            let v = jh[[d, m, t, f, p, q]];
                            jh[[d, m, t, f, p, q]] = g * v;
                        }
                    }
                }
            }
        }
    }
}

/// Sandwich a term's gains onto a model-shaped tensor in place:
/// `model[d,m,t,f,p,q] = G[d,p] · M · G[d,q]ᴴ`.
pub fn apply_gains(
    mut model: ArrayViewMut6<Jones<f64>>,
    gains: ArrayView4<Jones<f64>>,
    grid: &IntervalGrid,
) {
    let (n_dir, n_mod, n_tim, n_fre, n_ant, _) = model.dim();
    for d in 0..n_dir {
        let dg = dir_index(&gains, d);
        for m in 0..n_mod {
            for t in 0..n_tim {
                let ti = grid.t_index(t);
                for f in 0..n_fre {
                    let fi = grid.f_index(f);
                    for p in 0..n_ant {
                        let gp = gains[[dg, ti, fi, p]];
                        for q in 0..n_ant {
                            let gq = gains[[dg, ti, fi, q]];
                            let v = model[[d, m, t, f, p, q]];
                            model[[d, m, t, f, p, q]] = gp * v * gq.h();
                        }
                    }
                }
            }
        }
    }
}

/// Accumulate the right-hand side of the normal equations at full
/// time/frequency resolution:
/// `jhr[d,t,f,p] = Σ_{m,q≠p} R[m,t,f,p,q] · JH[d,m,t,f,q,p]`.
///
/// `r` is the observed data (single effective direction) or the residual
/// (multiple directions). Autocorrelations are excluded.
pub fn compute_jhr(
    jh: ArrayView6<Jones<f64>>,
    r: ArrayView5<Jones<f64>>,
    mut jhr: ArrayViewMut4<Jones<f64>>,
) {
    let (n_dir, n_mod, n_tim, n_fre, n_ant, _) = jh.dim();
    jhr.fill(Jones::default());
    for d in 0..n_dir {
        for m in 0..n_mod {
            for t in 0..n_tim {
                for f in 0..n_fre {
                    for p in 0..n_ant {
                        let mut acc = Jones::default();
                        for q in 0..n_ant {
                            if q == p {
                                continue;
                            }
                            acc += r[[m, t, f, p, q]] * jh[[d, m, t, f, q, p]];
                        }
                        jhr[[d, t, f, p]] += acc;
                    }
                }
            }
        }
    }
}

/// Sum a full-resolution JHR tensor into a term's solution intervals.
pub fn sum_jhr_intervals(
    jhr: ArrayView4<Jones<f64>>,
    grid: &IntervalGrid,
    mut jhr_int: ArrayViewMut4<Jones<f64>>,
) {
    let (n_dir, n_tim, n_fre, n_ant) = jhr.dim();
    jhr_int.fill(Jones::default());
    for d in 0..n_dir {
        for t in 0..n_tim {
            let ti = grid.t_index(t);
            for f in 0..n_fre {
                let fi = grid.f_index(f);
                for p in 0..n_ant {
                    let v = jhr[[d, t, f, p]];
                    jhr_int[[d, ti, fi, p]] += v;
                }
            }
        }
    }
}

/// Accumulate the curvature term of the normal equations per solution
/// interval: `jhj[d,ti,fi,p] = Σ_{m,t∈ti,f∈fi,q≠p} JHᴴ[q,p] · JH[q,p]`.
pub fn compute_jhj(
    jh: ArrayView6<Jones<f64>>,
    grid: &IntervalGrid,
    mut jhj: ArrayViewMut4<Jones<f64>>,
) {
    let (n_dir, n_mod, n_tim, n_fre, n_ant, _) = jh.dim();
    jhj.fill(Jones::default());
    for d in 0..n_dir {
        for m in 0..n_mod {
            for t in 0..n_tim {
                let ti = grid.t_index(t);
                for f in 0..n_fre {
                    let fi = grid.f_index(f);
                    for p in 0..n_ant {
                        let mut acc = Jones::default();
                        for q in 0..n_ant {
                            if q == p {
                                continue;
                            }
                            let z = jh[[d, m, t, f, q, p]];
                            acc += z.h() * z;
                        }
                        jhj[[d, ti, fi, p]] += acc;
                    }
                }
            }
        }
    }
}

/// Invert a gain-shaped tensor of curvature matrices, flagging
/// ill-conditioned cells.
///
/// Cells that are already flagged, or whose determinant fails the `eps`
/// test, produce a *zero* inverse so the corresponding update is a no-op.
/// Newly raised flags get `flagbit` and are counted in the return value.
pub fn invert_with_flags(
    src: ArrayView4<Jones<f64>>,
    eps: f64,
    flagbit: GainFlags,
    mut flags: ArrayViewMut4<GainFlags>,
    mut out: ArrayViewMut4<Jones<f64>>,
) -> usize {
    let mut flag_count = 0;
    azip!((&j in &src, fl in &mut flags, o in &mut out) {
        if fl.is_set() {
            *o = Jones::default();
        } else {
            match inv2x2(j, eps) {
                Some(inv) => *o = inv,
                None => {
                    *fl |= flagbit;
                    flag_count += 1;
                    *o = Jones::default();
                }
            }
        }
    });
    flag_count
}

/// Invert a gain tensor for application to data.
///
/// Unlike [`invert_with_flags`], failed cells substitute an *identity*
/// inverse: applying the inverse of a flagged gain must never introduce
/// non-finite values into the data, and identity leaves the data
/// untouched. Newly raised flags are counted.
pub fn invert_gains(
    gains: ArrayView4<Jones<f64>>,
    eps: f64,
    flagbit: GainFlags,
    mut flags: ArrayViewMut4<GainFlags>,
    mut out: ArrayViewMut4<Jones<f64>>,
) -> usize {
    let mut flag_count = 0;
    azip!((&g in &gains, fl in &mut flags, o in &mut out) {
        if fl.is_set() {
            *o = Jones::identity();
        } else {
            match inv2x2(g, eps) {
                Some(inv) => *o = inv,
                None => {
                    *fl |= flagbit;
                    flag_count += 1;
                    *o = Jones::identity();
                }
            }
        }
    });
    flag_count
}

/// The raw Gauss-Newton step per gain cell: `update = JHR · (JHJ)⁻¹`.
pub fn compute_update(
    jhr: ArrayView4<Jones<f64>>,
    jhjinv: ArrayView4<Jones<f64>>,
    mut update: ArrayViewMut4<Jones<f64>>,
) {
    azip!((&r in &jhr, &c in &jhjinv, u in &mut update) {
        *u = r * c;
    });
}

/// Left-multiply the inverse of a preceding chain term onto a
/// full-resolution JHR tensor, projecting residual information onto the
/// active term's parameter space.
pub fn apply_left_inv(
    mut jhr: ArrayViewMut4<Jones<f64>>,
    ginv: ArrayView4<Jones<f64>>,
    grid: &IntervalGrid,
) {
    let (n_dir, n_tim, n_fre, n_ant) = jhr.dim();
    for d in 0..n_dir {
        let dg = dir_index(&ginv, d);
        for t in 0..n_tim {
            let ti = grid.t_index(t);
            for f in 0..n_fre {
                let fi = grid.f_index(f);
                for p in 0..n_ant {
                    let v = jhr[[d, t, f, p]];
                    jhr[[d, t, f, p]] = ginv[[dg, ti, fi, p]] * v;
                }
            }
        }
    }
}

/// Correct a visibility-shaped tensor with inverted direction-independent
/// gains: `out[m,t,f,p,q] = G⁻¹[p] · V · G⁻ᴴ[q]`.
pub fn compute_corrected(
    vis: ArrayView5<Jones<f64>>,
    ginv: ArrayView4<Jones<f64>>,
    grid: &IntervalGrid,
    mut out: ArrayViewMut5<Jones<f64>>,
) {
    let (n_mod, n_tim, n_fre, n_ant, _) = vis.dim();
    for m in 0..n_mod {
        for t in 0..n_tim {
            let ti = grid.t_index(t);
            for f in 0..n_fre {
                let fi = grid.f_index(f);
                for p in 0..n_ant {
                    let gp = ginv[[0, ti, fi, p]];
                    for q in 0..n_ant {
                        let gq = ginv[[0, ti, fi, q]];
                        out[[m, t, f, p, q]] = gp * vis[[m, t, f, p, q]] * gq.h();
                    }
                }
            }
        }
    }
}

/// Subtract a gain-applied model from a visibility-shaped tensor, summing
/// over the direction axis: `resid[m,...] -= Σ_d gmodel[d,m,...]`.
pub fn subtract_model(mut resid: ArrayViewMut5<Jones<f64>>, gmodel: ArrayView6<Jones<f64>>) {
    for gmodel_d in gmodel.outer_iter() {
        azip!((r in &mut resid, &g in &gmodel_d) {
            *r = *r - g;
        });
    }
}

/// Sum a model tensor over its direction axis, keeping a length-1
/// direction axis, so a direction-independent term sees all sky directions
/// as one combined source.
pub fn sum_directions(model: ArrayView6<Jones<f64>>) -> Array6<Jones<f64>> {
    let (_, n_mod, n_tim, n_fre, n_ant, _) = model.dim();
    let mut out = Array6::from_elem((1, n_mod, n_tim, n_fre, n_ant, n_ant), Jones::default());
    for model_d in model.outer_iter() {
        let mut out0 = out.index_axis_mut(Axis(0), 0);
        azip!((o in &mut out0, &m in &model_d) {
            *o += m;
        });
    }
    out
}
