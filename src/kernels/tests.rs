// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Kernel unit tests on small hand-checkable tensors.

use approx::assert_abs_diff_eq;
use marlu::{c64, Jones};
use ndarray::prelude::*;

use super::*;
use crate::flagging::GainFlags;
use crate::intervals::IntervalGrid;

fn diag(a: f64, b: f64) -> Jones<f64> {
    Jones::from([c64::new(a, 0.0), c64::default(), c64::default(), c64::new(b, 0.0)])
}

#[test]
fn inv2x2_inverts_and_flags() {
    let j = diag(2.0, 4.0);
    let inv = inv2x2(j, 1e-12).unwrap();
    assert_abs_diff_eq!(inv, diag(0.5, 0.25), epsilon = 1e-15);

    // Singular matrix fails the determinant test.
    assert!(inv2x2(diag(1.0, 0.0), 1e-12).is_none());
    // Non-finite input never "succeeds" with NaN output.
    assert!(inv2x2(Jones::nan(), 1e-12).is_none());
}

#[test]
fn apply_gains_sandwiches() {
    let grid = IntervalGrid::new(1, 1, 1, 1);
    let gains = Array4::from_elem((1, 1, 1, 2), diag(2.0, 3.0));
    let mut model = Array6::from_elem((1, 1, 1, 1, 2, 2), Jones::identity());
    apply_gains(model.view_mut(), gains.view(), &grid);
    // G · I · Gᴴ with G = diag(2, 3) gives diag(4, 9).
    assert_abs_diff_eq!(model[[0, 0, 0, 0, 0, 1]], diag(4.0, 9.0), epsilon = 1e-15);
}

#[test]
fn apply_left_gains_multiplies_on_the_left_only() {
    let grid = IntervalGrid::new(1, 1, 1, 1);
    let mut gains = Array4::from_elem((1, 1, 1, 2), diag(2.0, 3.0));
    gains[[0, 0, 0, 1]] = diag(4.0, 5.0);
    // An off-diagonal model does not commute with the diagonal gains, so
    // G[p]·M, M·G[p] and G[q]·M are all distinguishable.
    let flip = Jones::from([
        c64::default(),
        c64::new(1.0, 0.0),
        c64::new(1.0, 0.0),
        c64::default(),
    ]);
    let mut jh = Array6::from_elem((1, 1, 1, 1, 2, 2), flip);
    apply_left_gains(jh.view_mut(), gains.view(), &grid);
    let expected_01 = Jones::from([
        c64::default(),
        c64::new(2.0, 0.0),
        c64::new(3.0, 0.0),
        c64::default(),
    ]);
    let expected_10 = Jones::from([
        c64::default(),
        c64::new(4.0, 0.0),
        c64::new(5.0, 0.0),
        c64::default(),
    ]);
    assert_abs_diff_eq!(jh[[0, 0, 0, 0, 0, 1]], expected_01, epsilon = 1e-15);
    assert_abs_diff_eq!(jh[[0, 0, 0, 0, 1, 0]], expected_10, epsilon = 1e-15);
}

#[test]
fn residual_subtracts_all_directions() {
    let mut resid = Array5::from_elem((1, 1, 1, 2, 2), Jones::identity() * 5.0);
    let gmodel = Array6::from_elem((2, 1, 1, 1, 2, 2), Jones::identity() * 2.0);
    subtract_model(resid.view_mut(), gmodel.view());
    assert_abs_diff_eq!(resid[[0, 0, 0, 0, 1]], Jones::identity(), epsilon = 1e-15);
}

#[test]
fn sum_directions_keeps_unit_axis() {
    let model = Array6::from_elem((3, 1, 2, 2, 2, 2), Jones::identity());
    let summed = sum_directions(model.view());
    assert_eq!(summed.len_of(Axis(0)), 1);
    assert_abs_diff_eq!(
        summed[[0, 0, 0, 0, 0, 1]],
        Jones::identity() * 3.0,
        epsilon = 1e-15
    );
}

#[test]
fn jhr_skips_autocorrelations() {
    // 2 antennas, everything scalar: JHR for antenna 0 must only see
    // baseline (0,1).
    let jh = Array6::from_elem((1, 1, 1, 1, 2, 2), Jones::identity() * 2.0);
    let r = Array5::from_elem((1, 1, 1, 2, 2), Jones::identity() * 3.0);
    let mut jhr = Array4::from_elem((1, 1, 1, 2), Jones::default());
    compute_jhr(jh.view(), r.view(), jhr.view_mut());
    assert_abs_diff_eq!(jhr[[0, 0, 0, 0]], Jones::identity() * 6.0, epsilon = 1e-15);
    assert_abs_diff_eq!(jhr[[0, 0, 0, 1]], Jones::identity() * 6.0, epsilon = 1e-15);
}

#[test]
fn jhj_accumulates_hermitian_squares() {
    let jh = Array6::from_elem((1, 1, 1, 1, 3, 3), Jones::identity() * 2.0);
    let grid = IntervalGrid::new(1, 1, 1, 1);
    let mut jhj = Array4::from_elem((1, 1, 1, 3), Jones::default());
    compute_jhj(jh.view(), &grid, jhj.view_mut());
    // Two contributing baselines per antenna, each Zᴴ·Z = 4·I.
    assert_abs_diff_eq!(jhj[[0, 0, 0, 0]], Jones::identity() * 8.0, epsilon = 1e-15);
}

#[test]
fn interval_summation() {
    let grid = IntervalGrid::new(4, 2, 2, 2);
    let jhr = Array4::from_elem((1, 4, 2, 1), Jones::identity());
    let mut jhr_int = Array4::from_elem((1, 2, 1, 1), Jones::nan());
    sum_jhr_intervals(jhr.view(), &grid, jhr_int.view_mut());
    // Each (ti, fi) cell collects 2 x 2 samples.
    assert_abs_diff_eq!(
        jhr_int[[0, 0, 0, 0]],
        Jones::identity() * 4.0,
        epsilon = 1e-15
    );
    assert_abs_diff_eq!(
        jhr_int[[0, 1, 0, 0]],
        Jones::identity() * 4.0,
        epsilon = 1e-15
    );
}

#[test]
fn curvature_inversion_flags_and_zeroes() {
    let mut src = Array4::from_elem((1, 1, 1, 3), diag(2.0, 2.0));
    src[[0, 0, 0, 1]] = diag(1.0, 0.0); // singular
    let mut flags = Array4::from_elem((1, 1, 1, 3), GainFlags::NONE);
    flags[[0, 0, 0, 2]] = GainFlags::MISSING; // pre-flagged
    let mut out = Array4::from_elem((1, 1, 1, 3), Jones::nan());

    let count = invert_with_flags(
        src.view(),
        1e-6,
        GainFlags::ILLCOND,
        flags.view_mut(),
        out.view_mut(),
    );
    assert_eq!(count, 1);
    assert_abs_diff_eq!(out[[0, 0, 0, 0]], diag(0.5, 0.5), epsilon = 1e-15);
    // Newly flagged and pre-flagged cells both get a zero inverse.
    assert_abs_diff_eq!(out[[0, 0, 0, 1]], Jones::default(), epsilon = 1e-15);
    assert_abs_diff_eq!(out[[0, 0, 0, 2]], Jones::default(), epsilon = 1e-15);
    assert!(flags[[0, 0, 0, 1]].contains(GainFlags::ILLCOND));
    // Pre-flagged cell is not double-counted.
    assert_eq!(flags[[0, 0, 0, 2]], GainFlags::MISSING);
}

#[test]
fn gain_inversion_substitutes_identity() {
    let mut gains = Array4::from_elem((1, 1, 1, 2), diag(2.0, 2.0));
    gains[[0, 0, 0, 1]] = Jones::default(); // null gain
    let mut flags = Array4::from_elem((1, 1, 1, 2), GainFlags::NONE);
    let mut out = Array4::from_elem((1, 1, 1, 2), Jones::nan());

    let count = invert_gains(
        gains.view(),
        1e-6,
        GainFlags::ILLCOND,
        flags.view_mut(),
        out.view_mut(),
    );
    assert_eq!(count, 1);
    assert_abs_diff_eq!(out[[0, 0, 0, 0]], diag(0.5, 0.5), epsilon = 1e-15);
    assert_abs_diff_eq!(out[[0, 0, 0, 1]], Jones::identity(), epsilon = 1e-15);
    assert!(!out[[0, 0, 0, 1]].any_nan());
}

#[test]
fn corrected_data_undoes_gains() {
    let grid = IntervalGrid::new(1, 1, 1, 1);
    let gains = Array4::from_elem((1, 1, 1, 2), diag(2.0, 2.0));

    // Corrupt identity data with the gains, then correct with the inverse.
    let mut vis = Array5::from_elem((1, 1, 1, 2, 2), Jones::identity());
    let mut as_model: Array6<Jones<f64>> = vis.clone().insert_axis(Axis(0));
    apply_gains(as_model.view_mut(), gains.view(), &grid);
    vis.assign(&as_model.index_axis(Axis(0), 0));

    let mut flags = Array4::from_elem((1, 1, 1, 2), GainFlags::NONE);
    let mut ginv = Array4::from_elem((1, 1, 1, 2), Jones::default());
    invert_gains(gains.view(), 1e-12, GainFlags::ILLCOND, flags.view_mut(), ginv.view_mut());

    let mut corr = Array5::from_elem((1, 1, 1, 2, 2), Jones::default());
    compute_corrected(vis.view(), ginv.view(), &grid, corr.view_mut());
    assert_abs_diff_eq!(corr[[0, 0, 0, 0, 1]], Jones::identity(), epsilon = 1e-12);
}
