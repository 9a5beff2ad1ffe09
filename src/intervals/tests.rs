// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use ndarray::prelude::*;

use super::{equations_per_slot, IntervalGrid};

#[test]
fn grid_maps_every_sample_exactly_once() {
    let grid = IntervalGrid::new(10, 7, 4, 3);
    assert_eq!(grid.n_t_ints(), 3);
    assert_eq!(grid.n_f_ints(), 3);

    // Contiguity: interval indices are non-decreasing and dense.
    let t_indices: Vec<usize> = (0..10).map(|t| grid.t_index(t)).collect();
    assert_eq!(t_indices, &[0, 0, 0, 0, 1, 1, 1, 1, 2, 2]);
    let f_indices: Vec<usize> = (0..7).map(|f| grid.f_index(f)).collect();
    assert_eq!(f_indices, &[0, 0, 0, 1, 1, 1, 2]);
}

#[test]
fn width_wider_than_axis_gives_single_interval() {
    let grid = IntervalGrid::new(4, 2, 100, 100);
    assert_eq!(grid.n_t_ints(), 1);
    assert_eq!(grid.n_f_ints(), 1);
    assert_eq!(grid.t_index(3), 0);
    assert_eq!(grid.f_index(1), 0);
}

#[test]
fn grid_spec_round_trips() {
    let grid = IntervalGrid::new(12, 8, 3, 2);
    assert_eq!(grid.spec().grid(), grid);
}

#[test]
fn equation_counts() {
    // 4 antennas: 6 baselines, 8 equations each, 1 model.
    let eqs = equations_per_slot(2, 3, 4, 1, None);
    assert!(eqs.iter().all(|&e| e == 48));

    // Flag every baseline in slot (0, 0).
    let mut flags = Array4::from_elem((2, 3, 4, 4), false);
    flags.slice_mut(s![0, 0, .., ..]).fill(true);
    let eqs = equations_per_slot(2, 3, 4, 1, Some(flags.view()));
    assert_eq!(eqs[[0, 0]], 0);
    assert_eq!(eqs[[0, 1]], 48);
    assert_eq!(eqs[[1, 0]], 48);

    // Two models double the count.
    let eqs = equations_per_slot(1, 1, 4, 2, None);
    assert_eq!(eqs[[0, 0]], 96);
}
