//! Error handling: the fatal error kinds and the process exit path.

use anyhow::Error;
use thiserror::Error as ThisError;

/// Errors that terminate the process with a specific exit code. Everything
/// else is request-local and recovered.
#[derive(Debug, ThisError)]
pub enum FatalError {
    /// The configuration is missing or malformed.
    #[error("configuration unusable: {0}")]
    ConfigUnusable(String),

    /// Local time conversion failed while formatting a record.
    #[error("time formatting failed for epoch {0}")]
    TimeFormat(i64),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::ConfigUnusable(_) => 255,
            FatalError::TimeFormat(_) => 254,
        }
    }
}

/// Report `err` with its cause chain and backtrace on stderr, and pick the
/// process exit code: a fatal error's own code when one is anywhere in the
/// chain, 1 otherwise.
pub(crate) fn report(err: &Error) -> i32 {
    eprintln!("Error: {:#}", err);
    eprintln!("{}", err.backtrace());
    err.downcast_ref::<FatalError>()
        .map(FatalError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_surface_through_context() {
        let err = Error::new(FatalError::ConfigUnusable("config.json".to_owned()));
        assert_eq!(report(&err), 255);

        let err = Error::new(FatalError::TimeFormat(-62167219200))
            .context("while rendering a cached record");
        assert_eq!(report(&err), 254);

        let err = anyhow::format_err!("some request-local problem");
        assert_eq!(report(&err), 1);
    }
}
