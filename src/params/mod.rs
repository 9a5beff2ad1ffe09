// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-term and chain configuration.
//!
//! Configuration mistakes (unknown variant, empty chain, out-of-range
//! indices) are programming errors, so they surface as [`ConfigError`] at
//! machine construction, before any solving begins. Data-dependent
//! problems never come through here; those are handled by flagging.

#[cfg(test)]
mod tests;

use std::str::FromStr;

use itertools::Itertools;
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::ChunkDims;

/// Gain parameterizations a term can solve for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum TermVariant {
    /// Full 2x2 complex Jones matrix per antenna.
    #[strum(serialize = "complex-2x2")]
    Complex2x2,

    /// Complex diagonal; off-diagonal terms are pinned to zero.
    #[strum(serialize = "complex-diag")]
    ComplexDiag,

    /// Diagonal phase-only, `diag(exp(iφ₁), exp(iφ₂))`.
    #[strum(serialize = "phase-only")]
    PhaseOnly,
}

impl TermVariant {
    /// Parse a variant name, turning unknown names into a [`ConfigError`].
    pub fn parse(name: &str) -> Result<TermVariant, ConfigError> {
        TermVariant::from_str(name).map_err(|_| ConfigError::UnknownVariant(name.to_string()))
    }
}

/// Configuration for one Jones term.
#[derive(Debug, Clone)]
pub struct TermParams {
    /// Label identifying the term; prefixes its exported-solution keys.
    pub label: String,

    /// Gain parameterization.
    pub variant: TermVariant,

    /// Whether the gains vary per sky-model direction.
    pub dd_term: bool,

    /// A non-solvable term is held fixed (e.g. loaded from a previous run)
    /// and never blocks chain convergence.
    pub solvable: bool,

    /// Solution-interval width in time samples.
    pub time_interval: usize,

    /// Solution-interval width in frequency channels.
    pub freq_interval: usize,

    /// Reference antenna for gauge fixing, if any.
    pub ref_ant: Option<usize>,

    /// Directions excluded from solving; their gains are held.
    pub fix_directions: Vec<usize>,

    /// Determinant magnitude below which a 2x2 inversion is declared
    /// ill-conditioned.
    pub eps: f64,

    /// Relative gain-update magnitude below which an interval counts as
    /// converged.
    pub delta_g: f64,

    /// Fraction of solvable cells that must be converged before the term
    /// reports convergence.
    pub conv_quorum: f64,

    /// Minimum real-equation count for an interval to be solvable; below
    /// this the interval is flagged missing.
    pub min_equations: usize,

    /// Iteration quota before a chain rotates away from this term.
    pub term_iters: u32,

    /// Iterations without improvement in the largest update before the
    /// term is declared stalled.
    pub stall_patience: u32,

    /// Lower amplitude bound for post-update flagging, if any.
    pub clip_low: Option<f64>,

    /// Upper amplitude bound for post-update flagging, if any.
    pub clip_high: Option<f64>,
}

impl Default for TermParams {
    fn default() -> TermParams {
        TermParams {
            label: "G".to_string(),
            variant: TermVariant::Complex2x2,
            dd_term: false,
            solvable: true,
            time_interval: 1,
            freq_interval: 1,
            ref_ant: None,
            fix_directions: vec![],
            eps: 1e-6,
            delta_g: 1e-6,
            conv_quorum: 1.0,
            min_equations: 1,
            term_iters: 20,
            stall_patience: 10,
            clip_low: None,
            clip_high: None,
        }
    }
}

impl TermParams {
    pub fn validate(&self, dims: &ChunkDims) -> Result<(), ConfigError> {
        if self.label.is_empty() || self.label.contains(':') {
            return Err(ConfigError::InvalidLabel {
                label: self.label.clone(),
            });
        }
        if self.time_interval == 0 {
            return Err(ConfigError::ZeroInterval {
                label: self.label.clone(),
                axis: "time",
            });
        }
        if self.freq_interval == 0 {
            return Err(ConfigError::ZeroInterval {
                label: self.label.clone(),
                axis: "frequency",
            });
        }
        if self.term_iters == 0 {
            return Err(ConfigError::ZeroTermIters {
                label: self.label.clone(),
            });
        }
        if let Some(ref_ant) = self.ref_ant {
            if ref_ant >= dims.n_ant {
                return Err(ConfigError::RefAntOutOfRange {
                    label: self.label.clone(),
                    ref_ant,
                    n_ant: dims.n_ant,
                });
            }
        }
        for &dir in &self.fix_directions {
            if dir >= dims.n_dir {
                return Err(ConfigError::FixedDirOutOfRange {
                    label: self.label.clone(),
                    dir,
                    n_dir: dims.n_dir,
                });
            }
        }
        Ok(())
    }
}

/// Configuration for a whole Jones chain, ordered left to right: the
/// first term is outermost in `G₁ G₂ … Gₙ M Gₙᴴ … G₁ᴴ`.
#[derive(Debug, Clone, Default)]
pub struct ChainParams {
    pub terms: Vec<TermParams>,
}

impl ChainParams {
    pub fn validate(&self, dims: &ChunkDims) -> Result<(), ConfigError> {
        if self.terms.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        if let Some(label) = self.terms.iter().map(|t| &t.label).duplicates().next() {
            return Err(ConfigError::DuplicateLabel(label.clone()));
        }
        for term in &self.terms {
            term.validate(dims)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("A Jones chain needs at least one term")]
    EmptyChain,

    #[error("Term label '{0}' appears more than once in the chain")]
    DuplicateLabel(String),

    #[error("Term label '{label}' is invalid; labels are non-empty and may not contain ':'")]
    InvalidLabel { label: String },

    #[error("Unrecognised term variant '{0}'")]
    UnknownVariant(String),

    #[error("Term '{label}': {axis} interval width must be at least 1")]
    ZeroInterval { label: String, axis: &'static str },

    #[error("Term '{label}': term_iters must be at least 1")]
    ZeroTermIters { label: String },

    #[error("Term '{label}': reference antenna {ref_ant} out of range; chunk has {n_ant} antennas")]
    RefAntOutOfRange {
        label: String,
        ref_ant: usize,
        n_ant: usize,
    },

    #[error("Term '{label}': fixed direction {dir} out of range; chunk has {n_dir} directions")]
    FixedDirOutOfRange {
        label: String,
        dir: usize,
        n_dir: usize,
    },
}
