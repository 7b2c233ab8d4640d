//! Error types for a single redshift step
//!
//! Every fatal condition aborts the whole step and is returned to the caller
//! as a [`ReionError`]. There is no partial result and no per-cell recovery:
//! all cells in a step share the same normalisation constants.
//!
//! # Kinds
//!
//! - [`ErrorKind::Config`]: a parameter combination that produced a physically
//!   invalid intermediate (zero Lyman-Werner threshold, unknown selector)
//! - [`ErrorKind::Numerical`]: a NaN or infinite reduction or per-cell value
//! - [`ErrorKind::Table`]: an interpolation query outside the table domain
//! - [`ErrorKind::PhotonConservation`]: the calibration curve returned a
//!   non-finite redshift, usually because reionization stalled

use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ReionError>;

/// Where in a step an error happened
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErrorContext {
    /// Redshift of the step being computed
    pub redshift: f64,
    /// Index into the radius sequence, if inside the radius loop
    pub radius_index: Option<usize>,
    /// Offending cell `(x, y, z)`, if a single cell is responsible
    pub cell: Option<[usize; 3]>,
}

impl ErrorContext {
    /// Context for a whole-step failure at `redshift`
    pub fn at(redshift: f64) -> Self {
        Self {
            redshift,
            radius_index: None,
            cell: None,
        }
    }

    /// Attach the radius index
    pub fn radius(mut self, index: usize) -> Self {
        self.radius_index = Some(index);
        self
    }

    /// Attach the cell coordinates
    pub fn cell(mut self, cell: [usize; 3]) -> Self {
        self.cell = Some(cell);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z={:.4}", self.redshift)?;
        if let Some(r) = self.radius_index {
            write!(f, ", radius index {r}")?;
        }
        if let Some([x, y, z]) = self.cell {
            write!(f, ", cell ({x},{y},{z})")?;
        }
        Ok(())
    }
}

/// Tag distinguishing the four failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Numerical,
    Table,
    PhotonConservation,
}

/// Fatal error for one redshift step
#[derive(Debug, Clone, Error)]
pub enum ReionError {
    /// Invalid parameter combination or physically invalid intermediate
    #[error("configuration error at {context}: {reason}")]
    Config { context: ErrorContext, reason: String },

    /// NaN or infinity in a reduction or per-cell quantity
    #[error("non-finite {quantity} at {context}: {detail}")]
    Numerical {
        context: ErrorContext,
        quantity: &'static str,
        detail: String,
    },

    /// Interpolation query outside the table domain
    #[error("{table} queried at {value:e} outside [{min:e}, {max:e}] at {context}")]
    Table {
        context: ErrorContext,
        table: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Photon-conservation calibration returned a non-finite redshift
    #[error("photon conservation failed at {context}: adjusted z={adjusted}, dz={delta_z}")]
    PhotonConservation {
        context: ErrorContext,
        adjusted: f64,
        delta_z: f64,
    },
}

impl ReionError {
    /// Shorthand for a configuration error
    pub fn config(context: ErrorContext, reason: impl Into<String>) -> Self {
        Self::Config {
            context,
            reason: reason.into(),
        }
    }

    /// Shorthand for a numerical error
    pub fn numerical(
        context: ErrorContext,
        quantity: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self::Numerical {
            context,
            quantity,
            detail: detail.into(),
        }
    }

    /// Kind tag for the driver
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Numerical { .. } => ErrorKind::Numerical,
            Self::Table { .. } => ErrorKind::Table,
            Self::PhotonConservation { .. } => ErrorKind::PhotonConservation,
        }
    }

    /// Context of the failing step
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Numerical { context, .. }
            | Self::Table { context, .. }
            | Self::PhotonConservation { context, .. } => context,
        }
    }

    /// Replace the redshift/radius context, keeping any cell already recorded
    ///
    /// Leaf collaborators don't know the step they run in, so the solvers
    /// stamp it on the way out.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        let slot = match &mut self {
            Self::Config { context, .. }
            | Self::Numerical { context, .. }
            | Self::Table { context, .. }
            | Self::PhotonConservation { context, .. } => context,
        };
        let cell = slot.cell.or(ctx.cell);
        let radius_index = slot.radius_index.or(ctx.radius_index);
        *slot = ErrorContext {
            redshift: ctx.redshift,
            radius_index,
            cell,
        };
        self
    }

    /// Actionable message for the caller driving the redshift loop
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { reason, .. } => format!("invalid parameters: {reason}"),
            Self::Numerical { quantity, .. } => {
                format!("numerical failure in {quantity}: check parameters for extreme values")
            }
            Self::Table { table, .. } => {
                format!("interpolation table {table} sized too small for its inputs")
            }
            Self::PhotonConservation { .. } => {
                "reionization stalled: check escape fraction or star formation efficiency"
                    .to_string()
            }
        }
    }
}

/// Return a numerical error unless `value` is finite
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) fn ensure_finite(value: f64, quantity: &'static str, context: ErrorContext) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ReionError::numerical(context, quantity, format!("value {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let ctx = ErrorContext::at(8.0);
        assert_eq!(ReionError::config(ctx, "bad").kind(), ErrorKind::Config);
        assert_eq!(
            ReionError::numerical(ctx, "xH", "nan").kind(),
            ErrorKind::Numerical
        );
        let table = ReionError::Table {
            context: ctx,
            table: "Nion",
            value: 2.0,
            min: 0.0,
            max: 1.0,
        };
        assert_eq!(table.kind(), ErrorKind::Table);
    }

    #[test]
    fn test_photon_conservation_message() {
        let err = ReionError::PhotonConservation {
            context: ErrorContext::at(7.0),
            adjusted: f64::NAN,
            delta_z: f64::NAN,
        };
        assert_eq!(err.kind(), ErrorKind::PhotonConservation);
        assert!(err.user_message().starts_with("reionization stalled"));
    }

    #[test]
    fn test_context_display() {
        let ctx = ErrorContext::at(9.5).radius(3).cell([1, 2, 3]);
        let text = ctx.to_string();
        assert!(text.contains("z=9.5000"));
        assert!(text.contains("radius index 3"));
        assert!(text.contains("cell (1,2,3)"));
    }

    #[test]
    fn test_with_context_keeps_cell() {
        let err = ReionError::numerical(ErrorContext::default().cell([4, 5, 6]), "Ts", "inf")
            .with_context(ErrorContext::at(12.0).radius(2));
        let ctx = err.context();
        assert_eq!(ctx.redshift, 12.0);
        assert_eq!(ctx.radius_index, Some(2));
        assert_eq!(ctx.cell, Some([4, 5, 6]));
    }

    #[test]
    fn test_ensure_finite() {
        let ctx = ErrorContext::at(6.0);
        assert!(ensure_finite(1.0, "x", ctx).is_ok());
        assert!(ensure_finite(f64::INFINITY, "x", ctx).is_err());
        assert!(ensure_finite(f64::NAN, "x", ctx).is_err());
    }
}
