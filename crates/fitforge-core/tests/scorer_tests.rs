use fitforge_core::bootstrap::{BootstrapWeights, RefWeights};
use fitforge_core::config::FitConfig;
use fitforge_core::scorer::Scorer;
use fitforge_core::table::TableData;
use fitforge_core::SENTINEL_SCORE;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn cfg_with_ref(dir: &TempDir, exp_body: &str, objfunc: u8) -> FitConfig {
    let exp = dir.path().join("data.exp");
    fs::write(&exp, exp_body).unwrap();
    FitConfig {
        model: PathBuf::from("m.bngl"),
        exp_files: vec![exp],
        output_dir: dir.path().join("out"),
        simulator: PathBuf::from("sim"),
        objfunc,
        var: vec![fitforge_core::config::VarSpec::Fixed {
            name: "k".into(),
            value: 1.0,
        }],
        ..Default::default()
    }
}

fn sim(body: &str) -> TableData {
    TableData::parse(Path::new("sim.gdat"), body).unwrap()
}

#[test]
fn absolute_objective_matches_hand_computation() {
    // Reference (0,1) (1,2) (2,3); simulation (0,1) (1,4) (2,3):
    // sqrt(0 + 4 + 0) = 2.
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 2\n2 3\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 1\n1 4\n2 3\n")]);
    assert!(!score.failed);
    assert_eq!(score.total, 2.0);
}

#[test]
fn relative_objective_rejects_zero_reference() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 0\n2 3\n", 3);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 1\n1 1\n2 3\n")]);
    assert!(score.failed);
    assert_eq!(score.total, SENTINEL_SCORE);
}

#[test]
fn alignment_skips_intermediate_simulation_rows() {
    // Simulation at {0, 0.5, 1, 1.5, 2}; reference at {0, 1, 2}. The rows at
    // 0.5 and 1.5 carry poison values that must never be read.
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 2\n2 3\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim(
        "# time A\n0 1\n0.5 999\n1 2\n1.5 999\n2 3\n",
    )]);
    assert!(!score.failed);
    assert_eq!(score.total, 0.0);
}

#[test]
fn short_simulation_is_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 2\n2 3\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 1\n1 2\n")]);
    assert!(score.failed);
}

#[test]
fn missing_column_is_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 2\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time B\n0 1\n1 2\n")]);
    assert!(score.failed);
}

#[test]
fn sd_objective_divides_by_sigma() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A A_SD\n0 1 0.5\n1 2 2\n", 2);
    let scorer = Scorer::new(&cfg, None).unwrap();
    // Residuals: ((1-2)/0.5)^2 = 4, ((2-4)/2)^2 = 1 -> sqrt(5).
    let score = scorer.score_tables(&[sim("# time A\n0 2\n1 4\n")]);
    assert!((score.total - 5f64.sqrt()).abs() < 1e-12);
}

#[test]
fn sd_objective_rejects_zero_sigma() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A A_SD\n0 1 0\n1 2 1\n", 2);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 2\n1 4\n")]);
    assert!(score.failed);
}

#[test]
fn column_mean_objective_uses_non_nan_mean() {
    let dir = tempfile::tempdir().unwrap();
    // Mean over {1, 3} = 2; the NaN row contributes nothing.
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 NaN\n2 3\n", 4);
    let scorer = Scorer::new(&cfg, None).unwrap();
    // Residuals: ((1-2)/2)^2 = 0.25 at t=0, ((3-5)/2)^2 = 1 at t=2.
    let score = scorer.score_tables(&[sim("# time A\n0 2\n1 0\n2 5\n")]);
    assert!((score.total - 1.25f64.sqrt()).abs() < 1e-12);
}

#[test]
fn nan_reference_points_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 NaN\n2 3\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 1\n1 12345\n2 3\n")]);
    assert_eq!(score.total, 0.0);
}

#[test]
fn bootstrap_weights_scale_residuals() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 2\n2 3\n", 1);
    let weights = BootstrapWeights {
        per_ref: vec![RefWeights {
            stem: "data".into(),
            columns: vec!["A".into()],
            rows: vec![vec![0], vec![3], vec![0]],
        }],
    };
    let scorer = Scorer::new(&cfg, Some(&weights)).unwrap();
    // Only the middle point counts, three times: sqrt(3 * (2-4)^2).
    let score = scorer.score_tables(&[sim("# time A\n0 5\n1 4\n2 7\n")]);
    assert!((score.total - 12f64.sqrt()).abs() < 1e-12);
}

#[test]
fn divide_by_init_normalizes_simulation() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 0.5\n", 1);
    cfg.divide_by_init = true;
    let scorer = Scorer::new(&cfg, None).unwrap();
    // Simulation (4, 2) becomes (1, 0.5) after dividing by the init value.
    let score = scorer.score_tables(&[sim("# time A\n0 4\n1 2\n")]);
    assert_eq!(score.total, 0.0);
}

#[test]
fn log_transform_applies_after_divide() {
    let dir = tempfile::tempdir().unwrap();
    // log10 of (1, 0.1) is (0, -1).
    let mut cfg = cfg_with_ref(&dir, "# time A\n0 0\n1 -1\n", 1);
    cfg.log_transform_sim_data = 10.0;
    let scorer = Scorer::new(&cfg, None).unwrap();
    let score = scorer.score_tables(&[sim("# time A\n0 1\n1 0.1\n")]);
    assert!(score.total.abs() < 1e-12);
}

#[test]
fn standardized_exp_passes_nan_through() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = cfg_with_ref(&dir, "# time A\n0 1\n1 NaN\n2 3\n", 1);
    cfg.standardize_exp_data = true;
    let scorer = Scorer::new(&cfg, None).unwrap();
    // Mean 2, sample sd sqrt(2): reference becomes (-1/sqrt2, NaN, 1/sqrt2).
    let inv = 1.0 / 2f64.sqrt();
    let score = scorer.score_tables(&[sim(&format!(
        "# time A\n0 {}\n1 0\n2 {}\n",
        -inv, inv
    ))]);
    assert!(score.total.abs() < 1e-9);
}

#[test]
fn scoring_is_bit_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = cfg_with_ref(&dir, "# time A B\n0 1 9\n1 2 8\n2 3 7\n", 1);
    let scorer = Scorer::new(&cfg, None).unwrap();
    let s = "# time A B\n0 1.1 9.7\n1 2.3 8.1\n2 3.14 6.9\n";
    let a = scorer.score_tables(&[sim(s)]);
    let b = scorer.score_tables(&[sim(s)]);
    assert_eq!(a.total.to_bits(), b.total.to_bits());
    assert_eq!(a.per_ref[0].to_bits(), b.per_ref[0].to_bits());
}
