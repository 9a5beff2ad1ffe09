// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use super::*;

fn dims() -> ChunkDims {
    ChunkDims {
        n_dir: 2,
        n_mod: 1,
        n_tim: 4,
        n_fre: 4,
        n_ant: 4,
    }
}

#[test]
fn variant_names_round_trip() {
    for (name, variant) in [
        ("complex-2x2", TermVariant::Complex2x2),
        ("complex-diag", TermVariant::ComplexDiag),
        ("phase-only", TermVariant::PhaseOnly),
    ] {
        assert_eq!(TermVariant::parse(name).unwrap(), variant);
        assert_eq!(variant.to_string(), name);
    }
}

#[test]
fn unknown_variant_is_a_config_error() {
    let result = TermVariant::parse("robust-2x2");
    assert!(matches!(result, Err(ConfigError::UnknownVariant(_))));
}

#[test]
fn default_term_validates() {
    TermParams::default().validate(&dims()).unwrap();
}

#[test]
fn bad_terms_are_rejected() {
    let d = dims();

    let t = TermParams {
        label: "G:bad".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        t.validate(&d),
        Err(ConfigError::InvalidLabel { .. })
    ));

    let t = TermParams {
        time_interval: 0,
        ..Default::default()
    };
    assert!(matches!(
        t.validate(&d),
        Err(ConfigError::ZeroInterval { axis: "time", .. })
    ));

    let t = TermParams {
        ref_ant: Some(4),
        ..Default::default()
    };
    assert!(matches!(
        t.validate(&d),
        Err(ConfigError::RefAntOutOfRange { ref_ant: 4, .. })
    ));

    let t = TermParams {
        fix_directions: vec![2],
        ..Default::default()
    };
    assert!(matches!(
        t.validate(&d),
        Err(ConfigError::FixedDirOutOfRange { dir: 2, .. })
    ));
}

#[test]
fn chain_needs_terms_and_unique_labels() {
    let d = dims();
    let chain = ChainParams { terms: vec![] };
    assert!(matches!(chain.validate(&d), Err(ConfigError::EmptyChain)));

    let chain = ChainParams {
        terms: vec![TermParams::default(), TermParams::default()],
    };
    assert!(matches!(
        chain.validate(&d),
        Err(ConfigError::DuplicateLabel(_))
    ));

    let chain = ChainParams {
        terms: vec![
            TermParams {
                label: "B".to_string(),
                ..Default::default()
            },
            TermParams {
                label: "G".to_string(),
                ..Default::default()
            },
        ],
    };
    chain.validate(&d).unwrap();
}
