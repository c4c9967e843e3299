//! Error taxonomy shared by every calculator.
use thiserror::Error;

use crate::enhancement::EnhancementReport;

/// Errors raised at the boundary of a failing calculator call.
#[derive(Debug, Error, PartialEq)]
pub enum BalanceError {
    /// Malformed or out-of-domain configuration.
    #[error("invalid configuration at {field}: {reason}")]
    Config { field: String, reason: String },
    /// Mathematically undefined evaluation request.
    #[error("{operation} is undefined: {reason}")]
    Domain {
        operation: &'static str,
        reason: String,
    },
    /// A chain or simulation did not absorb within its safeguard limit.
    #[error("{context} did not converge within {limit} steps")]
    Convergence {
        context: String,
        limit: u64,
        partial: Option<Box<EnhancementReport>>,
    },
}

impl BalanceError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn domain(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Domain {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn convergence(context: impl Into<String>, limit: u64) -> Self {
        Self::Convergence {
            context: context.into(),
            limit,
            partial: None,
        }
    }

    /// Field path named by a configuration error, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Config { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Whether this error belongs to the warning class the caller may relax.
    #[must_use]
    pub const fn is_convergence(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BalanceError>;
