use thiserror::Error;

/// Root causes that abort a login attempt.
///
/// These are raised at the failing boundary and travel up wrapped in
/// `anyhow` context, so callers match them with `downcast_ref`.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no account for user {0:?}")]
    Identity(String),

    #[error("{action} failed: {source}")]
    Resource {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: {reason}")]
    ExternalProcess { program: String, reason: String },
}

impl LoginError {
    pub fn resource(action: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        Self::Resource {
            action: action.into(),
            source: source.into(),
        }
    }

    pub fn external(program: impl ToString, reason: impl ToString) -> Self {
        Self::ExternalProcess {
            program: program.to_string(),
            reason: reason.to_string(),
        }
    }
}
