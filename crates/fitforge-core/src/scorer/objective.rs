use crate::error::{FfResult, FitError};

/// The four objective-function variants, keyed by the config selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// (e - s)^2
    Absolute,
    /// ((e - s) / sigma)^2 with the paired `_SD` column.
    Sd,
    /// ((e - s) / e)^2
    Relative,
    /// ((e - s) / col_mean)^2 over non-NaN reference values.
    ColumnMean,
}

impl Objective {
    pub fn from_selector(sel: u8) -> FfResult<Self> {
        match sel {
            1 => Ok(Objective::Absolute),
            2 => Ok(Objective::Sd),
            3 => Ok(Objective::Relative),
            4 => Ok(Objective::ColumnMean),
            other => Err(FitError::Config(format!(
                "objective selector must be 1..4, got {}",
                other
            ))),
        }
    }

    pub fn needs_sd_columns(self) -> bool {
        self == Objective::Sd
    }
}
