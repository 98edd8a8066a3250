//! Initial-population generation from declarative variable specs.
//!
//! Specs are applied in declaration order against a working set of partial
//! vectors: `list`/`linear`/`log` take the Cartesian product, `static_list`
//! zips, and the random families either append one fresh sample to every
//! existing row or expand a single/empty working set to the target size.

use crate::config::{FitConfig, VarSpec};
use crate::error::{FfResult, FitError};
use std::f64::consts::TAU;

pub type ParamVector = Vec<f64>;

/// Ordered parameter names; every vector in a run shares this schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSchema {
    pub names: Vec<String>,
}

impl ParamSchema {
    pub fn from_specs(var: &[VarSpec]) -> FfResult<Self> {
        let mut names: Vec<String> = Vec::with_capacity(var.len());
        for spec in var {
            let name = spec.name();
            if names.iter().any(|n| n == name) {
                return Err(FitError::Config(format!(
                    "parameter '{}' declared more than once",
                    name
                )));
            }
            names.push(name.to_string());
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// `steps` equally spaced values over [first, last], last one exact.
pub fn linear_values(first: f64, last: f64, steps: usize) -> Vec<f64> {
    let span = last - first;
    let mut out: Vec<f64> = (0..steps)
        .map(|i| first + span * i as f64 / (steps - 1) as f64)
        .collect();
    out[steps - 1] = last;
    out
}

/// `base` raised to equally spaced exponents in [first, last], optionally
/// rounded to `mantissa` significant digits.
pub fn log_values(first: f64, last: f64, steps: usize, mantissa: usize, base: f64) -> Vec<f64> {
    linear_values(first, last, steps)
        .into_iter()
        .map(|e| {
            let v = base.powf(e);
            if mantissa == 0 {
                v
            } else {
                round_significant(v, mantissa)
            }
        })
        .collect()
}

fn round_significant(v: f64, digits: usize) -> f64 {
    if v == 0.0 || !v.is_finite() {
        return v;
    }
    let magnitude = v.abs().log10().floor();
    let factor = 10f64.powf(digits as f64 - 1.0 - magnitude);
    (v * factor).round() / factor
}

fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    // Box-Muller; reject u1 == 0 to keep ln() finite.
    loop {
        let u1 = rng.f64();
        if u1 > 0.0 {
            let u2 = rng.f64();
            return (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        }
    }
}

fn sample(spec: &VarSpec, rng: &mut fastrand::Rng) -> f64 {
    match spec {
        VarSpec::Random { min, max, .. } => min + rng.f64() * (max - min),
        VarSpec::Loguniform { min, max, .. } => {
            let lo = min.log10();
            let hi = max.log10();
            10f64.powf(lo + rng.f64() * (hi - lo))
        }
        VarSpec::Lognormrandom { mean, stddev, .. } => {
            (mean.ln() + standard_normal(rng) * stddev).exp()
        }
        _ => unreachable!("sample() is only called for random specs"),
    }
}

fn cartesian(rows: Vec<ParamVector>, values: &[f64]) -> Vec<ParamVector> {
    let mut out = Vec::with_capacity(rows.len() * values.len());
    for row in &rows {
        for &v in values {
            let mut next = row.clone();
            next.push(v);
            out.push(next);
        }
    }
    out
}

/// Produce the generation-1 population: `first_gen_permutations` vectors when
/// the oversize override is set, else `permutations`. Fewer rows than the
/// target is a configuration error; extra rows are dropped from the tail.
pub fn generate_initial(cfg: &FitConfig, rng: &mut fastrand::Rng) -> FfResult<Vec<ParamVector>> {
    let target = cfg.first_gen_target();
    let mut rows: Vec<ParamVector> = vec![Vec::new()];

    for spec in &cfg.var {
        rows = match spec {
            VarSpec::Fixed { value, .. } => {
                for row in &mut rows {
                    row.push(*value);
                }
                rows
            }
            VarSpec::List { values, .. } => cartesian(rows, values),
            VarSpec::Linear {
                first, last, steps, ..
            } => cartesian(rows, &linear_values(*first, *last, *steps)),
            VarSpec::Log {
                first,
                last,
                steps,
                mantissa,
                base,
                ..
            } => cartesian(rows, &log_values(*first, *last, *steps, *mantissa, *base)),
            VarSpec::StaticList { name, values } => {
                if rows.len() == 1 && rows[0].is_empty() {
                    values.iter().map(|&v| vec![v]).collect()
                } else if rows.len() == values.len() {
                    for (row, &v) in rows.iter_mut().zip(values) {
                        row.push(v);
                    }
                    rows
                } else {
                    return Err(FitError::Config(format!(
                        "var '{}': static_list length {} does not match working set size {}",
                        name,
                        values.len(),
                        rows.len()
                    )));
                }
            }
            VarSpec::Random { .. } | VarSpec::Loguniform { .. } | VarSpec::Lognormrandom { .. } => {
                if rows.len() >= 2 {
                    for row in &mut rows {
                        row.push(sample(spec, rng));
                    }
                    rows
                } else {
                    // Single or empty working set: expand to the target by
                    // independent sampling.
                    let base = rows.pop().unwrap_or_default();
                    (0..target)
                        .map(|_| {
                            let mut next = base.clone();
                            next.push(sample(spec, rng));
                            next
                        })
                        .collect()
                }
            }
        };
    }

    if rows.len() < target {
        return Err(FitError::Config(format!(
            "var specs produce {} permutations but {} are required",
            rows.len(),
            target
        )));
    }
    rows.truncate(target);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitConfig;

    fn cfg_with(var: Vec<VarSpec>, permutations: usize) -> FitConfig {
        FitConfig {
            model: "m.bngl".into(),
            exp_files: vec!["d.exp".into()],
            output_dir: "out".into(),
            simulator: "sim".into(),
            permutations,
            var,
            ..Default::default()
        }
    }

    #[test]
    fn linear_spacing_is_exact() {
        let vals = linear_values(0.0, 1.0, 5);
        assert_eq!(vals, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(vals[4], 1.0);
    }

    #[test]
    fn log_spacing_is_geometric() {
        let vals = log_values(0.0, 2.0, 3, 0, 10.0);
        assert_eq!(vals, vec![1.0, 10.0, 100.0]);
        let rounded = log_values(0.0, 1.0, 3, 2, 10.0);
        assert_eq!(rounded[1], 3.2); // 10^0.5 = 3.1623 to 2 significant digits
    }

    #[test]
    fn list_takes_cartesian_product() {
        let cfg = cfg_with(
            vec![
                VarSpec::List {
                    name: "a".into(),
                    values: vec![1.0, 2.0],
                },
                VarSpec::List {
                    name: "b".into(),
                    values: vec![10.0, 20.0],
                },
            ],
            4,
        );
        let mut rng = fastrand::Rng::with_seed(1);
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![1.0, 10.0],
                vec![1.0, 20.0],
                vec![2.0, 10.0],
                vec![2.0, 20.0]
            ]
        );
    }

    #[test]
    fn static_list_zips() {
        let cfg = cfg_with(
            vec![
                VarSpec::List {
                    name: "a".into(),
                    values: vec![1.0, 2.0, 3.0],
                },
                VarSpec::StaticList {
                    name: "b".into(),
                    values: vec![10.0, 20.0, 30.0],
                },
            ],
            3,
        );
        let mut rng = fastrand::Rng::with_seed(1);
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(rows, vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]]);
    }

    #[test]
    fn static_list_size_mismatch_is_fatal() {
        let cfg = cfg_with(
            vec![
                VarSpec::List {
                    name: "a".into(),
                    values: vec![1.0, 2.0],
                },
                VarSpec::StaticList {
                    name: "b".into(),
                    values: vec![10.0],
                },
            ],
            2,
        );
        let mut rng = fastrand::Rng::with_seed(1);
        assert!(generate_initial(&cfg, &mut rng).is_err());
    }

    #[test]
    fn random_expands_to_population_size() {
        let cfg = cfg_with(
            vec![
                VarSpec::Fixed {
                    name: "a".into(),
                    value: 7.0,
                },
                VarSpec::Random {
                    name: "b".into(),
                    min: 0.0,
                    max: 1.0,
                },
            ],
            16,
        );
        let mut rng = fastrand::Rng::with_seed(42);
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(rows.len(), 16);
        for row in &rows {
            assert_eq!(row[0], 7.0);
            assert!((0.0..1.0).contains(&row[1]));
        }
    }

    #[test]
    fn random_appends_when_set_is_wide() {
        let cfg = cfg_with(
            vec![
                VarSpec::List {
                    name: "a".into(),
                    values: vec![1.0, 2.0, 3.0],
                },
                VarSpec::Random {
                    name: "b".into(),
                    min: 5.0,
                    max: 6.0,
                },
            ],
            3,
        );
        let mut rng = fastrand::Rng::with_seed(3);
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][0], 3.0);
    }

    #[test]
    fn loguniform_stays_in_range() {
        let cfg = cfg_with(
            vec![VarSpec::Loguniform {
                name: "k".into(),
                min: 1e-3,
                max: 1e3,
            }],
            64,
        );
        let mut rng = fastrand::Rng::with_seed(9);
        for row in generate_initial(&cfg, &mut rng).unwrap() {
            assert!(row[0] >= 1e-3 && row[0] <= 1e3);
        }
    }

    #[test]
    fn undersized_output_is_fatal() {
        let cfg = cfg_with(
            vec![VarSpec::List {
                name: "a".into(),
                values: vec![1.0, 2.0],
            }],
            8,
        );
        let mut rng = fastrand::Rng::with_seed(1);
        assert!(matches!(
            generate_initial(&cfg, &mut rng),
            Err(FitError::Config(_))
        ));
    }

    #[test]
    fn oversized_output_is_truncated() {
        let mut cfg = cfg_with(
            vec![VarSpec::Linear {
                name: "a".into(),
                first: 0.0,
                last: 1.0,
                steps: 10,
            }],
            4,
        );
        let mut rng = fastrand::Rng::with_seed(1);
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(rows.len(), 4);

        cfg.first_gen_permutations = 8;
        let rows = generate_initial(&cfg, &mut rng).unwrap();
        assert_eq!(rows.len(), 8);
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let cfg = cfg_with(
            vec![VarSpec::Lognormrandom {
                name: "k".into(),
                mean: 1.0,
                stddev: 0.5,
            }],
            12,
        );
        let a = generate_initial(&cfg, &mut fastrand::Rng::with_seed(7)).unwrap();
        let b = generate_initial(&cfg, &mut fastrand::Rng::with_seed(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_names_rejected() {
        let specs = vec![
            VarSpec::Fixed {
                name: "k".into(),
                value: 1.0,
            },
            VarSpec::Fixed {
                name: "k".into(),
                value: 2.0,
            },
        ];
        assert!(ParamSchema::from_specs(&specs).is_err());
    }
}
