use thiserror::Error;

use crate::solver::ExitClass;

#[derive(Debug, Error)]
pub enum BesoError {
    /// Bad or missing run parameters. Non-fatal where the run can proceed
    /// (e.g. an unreachable mass goal), in which case it is only logged.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external solver process did not finish successfully.
    #[error("Solver error ({class}): {message}")]
    Solver { class: ExitClass, message: String },

    /// The solver exited cleanly but the results the objective needs are absent.
    #[error("Data missing error: {0}")]
    DataMissing(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BesoError {
    /// Whether the optimization loop must stop on this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BesoError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_fatal() {
        let err = BesoError::Configuration("mass goal unreachable".to_owned());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("mass goal unreachable"));
    }

    #[test]
    fn solver_error_names_exit_class() {
        let err = BesoError::Solver {
            class: ExitClass::MalformedInput,
            message: "cannot open job file".to_owned(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("malformed input"));
    }
}
