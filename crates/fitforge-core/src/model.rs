//! Model-file materialization. A template model is plain text with a
//! `begin parameters` .. `end parameters` block; materializing substitutes
//! the fitted values into that block and prepends a machine-readable
//! change-log header. The header is the contract with the scorer, which
//! recovers parameter vectors from disk by parsing it back.

use crate::error::{FfResult, FitError};
use crate::population::{ParamSchema, ParamVector};
use std::fs;
use std::path::{Path, PathBuf};

pub const CHANGELOG_SENTINEL: &str = "# End of permute change log";

#[derive(Debug, Clone)]
pub struct ModelTemplate {
    pub path: PathBuf,
    lines: Vec<String>,
    /// Line index range of the parameters block body (exclusive of markers).
    param_block: (usize, usize),
}

impl ModelTemplate {
    pub fn load(path: &Path) -> FfResult<Self> {
        let text = fs::read_to_string(path)?;
        let lines = join_continuations(&text);
        let param_block = find_param_block(&lines).ok_or_else(|| {
            FitError::Model(format!(
                "{}: no 'begin parameters' .. 'end parameters' block",
                path.display()
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            lines,
            param_block,
        })
    }

    pub fn stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
    }

    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("bngl")
    }

    /// Output path for a permutation's materialized model.
    pub fn perm_path(&self, gen_dir: &Path, perm: usize) -> PathBuf {
        gen_dir.join(format!("{}_perm{}.{}", self.stem(), perm, self.extension()))
    }

    /// Write the template back out unmodified (continuations joined). Used
    /// for the one-off network-generation run.
    pub fn write_plain(&self, out_path: &Path) -> FfResult<()> {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        fs::write(out_path, out)?;
        Ok(())
    }

    /// Write a concrete model for one permutation: substituted parameter
    /// values, change-log header, and (for the ODE path) the network-file
    /// reference in place of network generation.
    pub fn materialize(
        &self,
        schema: &ParamSchema,
        vector: &ParamVector,
        out_path: &Path,
        net_file: Option<&Path>,
    ) -> FfResult<()> {
        let mut lines = self.lines.clone();
        let (block_start, block_end) = self.param_block;

        for (name, &value) in schema.names.iter().zip(vector) {
            let mut replaced = false;
            for line in &mut lines[block_start..block_end] {
                if let Some(rewritten) = substitute(line, name, value) {
                    *line = rewritten;
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                return Err(FitError::Model(format!(
                    "parameter '{}' not found in the parameters block of {}",
                    name,
                    self.path.display()
                )));
            }
        }

        if let Some(net) = net_file {
            for line in &mut lines {
                if line.trim_start().starts_with("generate_network") {
                    *line = format!("readFile({{file=>\"{}\"}})", net.display());
                }
            }
        }

        let mut out = String::new();
        for (name, &value) in schema.names.iter().zip(vector) {
            out.push_str(&format!("# {} changed to {}\n", name, value));
        }
        out.push_str(CHANGELOG_SENTINEL);
        out.push('\n');
        for line in &lines {
            out.push_str(line);
            out.push('\n');
        }
        fs::write(out_path, out)?;
        Ok(())
    }
}

/// Recover the parameter vector a materialized model was written with.
pub fn read_changelog(path: &Path, schema: &ParamSchema) -> FfResult<ParamVector> {
    let text = fs::read_to_string(path)?;
    let mut values: Vec<Option<f64>> = vec![None; schema.len()];

    for line in text.lines() {
        if line.trim() == CHANGELOG_SENTINEL {
            break;
        }
        let Some(rest) = line.strip_prefix("# ") else {
            continue;
        };
        let Some((name, value_str)) = rest.split_once(" changed to ") else {
            continue;
        };
        let idx = schema.index_of(name.trim()).ok_or_else(|| {
            FitError::Model(format!(
                "{}: change log names unknown parameter '{}'",
                path.display(),
                name
            ))
        })?;
        let value = value_str.trim().parse::<f64>().map_err(|_| {
            FitError::Model(format!(
                "{}: bad change log value '{}'",
                path.display(),
                value_str
            ))
        })?;
        values[idx] = Some(value);
    }

    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.ok_or_else(|| {
                FitError::Model(format!(
                    "{}: change log missing parameter '{}'",
                    path.display(),
                    schema.names[i]
                ))
            })
        })
        .collect()
}

/// Merge backslash-continued lines into single logical lines.
fn join_continuations(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let mut line = match pending.take() {
            Some(mut prev) => {
                prev.push_str(raw.trim_start());
                prev
            }
            None => raw.to_string(),
        };
        if let Some(stripped) = line.strip_suffix('\\') {
            line = stripped.trim_end().to_string();
            line.push(' ');
            pending = Some(line);
        } else {
            out.push(line);
        }
    }
    if let Some(rest) = pending {
        out.push(rest);
    }
    out
}

fn find_param_block(lines: &[String]) -> Option<(usize, usize)> {
    let start = lines
        .iter()
        .position(|l| l.trim() == "begin parameters")?;
    let end = lines[start..]
        .iter()
        .position(|l| l.trim() == "end parameters")?
        + start;
    Some((start + 1, end))
}

/// If `line` assigns parameter `name`, rebuild it with the new value,
/// preserving indentation and an optional leading index token.
fn substitute(line: &str, name: &str, value: f64) -> Option<String> {
    let indent_len = line.len() - line.trim_start().len();
    let indent = &line[..indent_len];
    let mut tokens = line.split_whitespace();

    let first = tokens.next()?;
    if first == name {
        return Some(format!("{}{} {}", indent, name, value));
    }
    // BNGL allows a numeric index before the parameter name.
    if first.parse::<u64>().is_ok() && tokens.next()? == name {
        return Some(format!("{}{} {} {}", indent, first, name, value));
    }
    None
}
