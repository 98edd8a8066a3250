//! Replicate averaging. With `smoothing > 1` every permutation runs R times,
//! each replicate in its own numbered subdirectory; the averager folds the
//! surviving replicates into one mean output per (permutation, suffix) at
//! the generation level, where the scorer expects it. A permutation is
//! failed only when every replicate failed.

use crate::error::FfResult;
use crate::table::TableData;
use std::path::Path;
use tracing::warn;

/// Sentinel-based replicate survival: finished marker present, failed absent.
fn replicate_alive(gen_dir: &Path, replicate: usize, base: &str) -> bool {
    let dir = gen_dir.join(replicate.to_string());
    dir.join(format!("{}.finished", base)).exists()
        && !dir.join(format!("{}.failed", base)).exists()
}

/// Average all replicates of one generation. Returns the permutations whose
/// replicates all failed (or produced unusable output).
pub fn average_generation(
    gen_dir: &Path,
    model_stem: &str,
    perms: &[usize],
    suffixes: &[String],
    replicates: usize,
    scan_parameter: Option<&str>,
) -> FfResult<Vec<usize>> {
    let mut failed = Vec::new();

    'perm: for &perm in perms {
        let base = format!("{}_perm{}", model_stem, perm);
        let alive: Vec<usize> = (1..=replicates)
            .filter(|&r| replicate_alive(gen_dir, r, &base))
            .collect();

        if alive.is_empty() {
            failed.push(perm);
            continue;
        }

        for suffix in suffixes {
            let mut tables: Vec<TableData> = Vec::with_capacity(alive.len());
            for &r in &alive {
                let path = gen_dir
                    .join(r.to_string())
                    .join(format!("{}_{}.gdat", base, suffix));
                match TableData::load(&path) {
                    Ok(t) => tables.push(t),
                    Err(e) => warn!("perm {} rep {}: unreadable output: {}", perm, r, e),
                }
            }
            let Some(avg) = average_tables(&tables, scan_parameter) else {
                warn!("perm {}: no usable replicate output for '{}'", perm, suffix);
                failed.push(perm);
                continue 'perm;
            };
            avg.write(&gen_dir.join(format!("{}_{}.gdat", base, suffix)))?;
        }
    }

    Ok(failed)
}

/// Arithmetic mean per (row, column != control) across structurally identical
/// tables; the control column is carried over from the first.
pub fn average_tables(tables: &[TableData], scan_parameter: Option<&str>) -> Option<TableData> {
    let first = tables.first()?;
    let control = first.control_index(scan_parameter).ok()?;
    let usable: Vec<&TableData> = tables
        .iter()
        .filter(|t| t.columns == first.columns && t.rows.len() == first.rows.len())
        .collect();
    if usable.len() < tables.len() {
        warn!("{}: replicate schema mismatch, mismatched outputs dropped", first.path.display());
    }
    if usable.is_empty() {
        return None;
    }

    let mut out = first.clone();
    let n = usable.len() as f64;
    for (ri, row) in out.rows.iter_mut().enumerate() {
        for (ci, cell) in row.iter_mut().enumerate() {
            if ci == control {
                continue;
            }
            *cell = usable.iter().map(|t| t.rows[ri][ci]).sum::<f64>() / n;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn table(rows: &[[f64; 2]]) -> TableData {
        TableData {
            path: PathBuf::from("r.gdat"),
            columns: vec!["time".into(), "A".into()],
            rows: rows.iter().map(|r| r.to_vec()).collect(),
        }
    }

    #[test]
    fn means_skip_the_control_column() {
        let a = table(&[[0.0, 2.0], [1.0, 4.0]]);
        let b = table(&[[0.0, 4.0], [1.0, 8.0]]);
        let avg = average_tables(&[a, b], None).unwrap();
        assert_eq!(avg.rows[0], vec![0.0, 3.0]);
        assert_eq!(avg.rows[1], vec![1.0, 6.0]);
    }

    #[test]
    fn averaging_is_idempotent_on_one_table() {
        let a = table(&[[0.0, 2.0], [1.0, 4.0]]);
        let once = average_tables(&[a.clone()], None).unwrap();
        let twice = average_tables(&[once.clone()], None).unwrap();
        assert_eq!(once.rows, twice.rows);
        assert_eq!(once.rows, a.rows);
    }

    #[test]
    fn schema_mismatch_drops_the_outlier() {
        let a = table(&[[0.0, 2.0]]);
        let mut b = table(&[[0.0, 4.0]]);
        b.columns = vec!["time".into(), "B".into()];
        let avg = average_tables(&[a, b], None).unwrap();
        assert_eq!(avg.rows[0][1], 2.0);
    }
}
