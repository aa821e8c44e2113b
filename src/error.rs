//! Errors raised by linearization and linear solves.
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Some process failed to linearize the system, an auxiliary equation or to set up the
    /// preconditioner.
    ///
    /// Raised on every process after the failure has been reduced across all of them. The outer
    /// Newton loop is expected to retry with a smaller step. `cause` holds the local fault if this
    /// process is one of the failing ones.
    NumericalIssue {
        message: String,
        cause: Option<eyre::Report>,
    },
    /// The sparsity structure could not be built. Not recoverable.
    Structure(String),
    /// A collective communication failed.
    Communication(String),
    /// Invalid settings or resources that could not be set up.
    Configuration(String),
}

impl Error {
    pub fn numerical_issue(message: impl Into<String>, cause: Option<eyre::Report>) -> Self {
        Self::NumericalIssue {
            message: message.into(),
            cause,
        }
    }

    pub fn is_numerical_issue(&self) -> bool {
        matches!(self, Self::NumericalIssue { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumericalIssue { message, cause } => {
                write!(f, "Numerical issue: {}", message)?;
                if let Some(cause) = cause {
                    write!(f, " (local cause: {})", cause)?;
                }
                Ok(())
            }
            Self::Structure(message) => write!(f, "Failed to build linear system structure: {}", message),
            Self::Communication(message) => write!(f, "Communication failed: {}", message),
            Self::Configuration(message) => write!(f, "Invalid configuration: {}", message),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::NumericalIssue { cause: Some(cause), .. } => {
                let cause: &(dyn StdError + 'static) = cause.as_ref();
                Some(cause)
            }
            _ => None,
        }
    }
}
