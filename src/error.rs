use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Node execution error: {0}")]
    NodeExecution(String),

    #[error("Invalid node transition: {0}")]
    InvalidTransition(String),

    #[error("Context error: {0}")]
    Context(String),

    #[error("SQL validation error: {0}")]
    Validation(String),

    #[error("Database execution failed: {0}")]
    Execution(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Malformed LLM output: {0}")]
    MalformedOutput(String),

    #[error("Unsupported chart type: {0}")]
    UnsupportedChart(String),

    #[error("Visualization error: {0}")]
    Visualization(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Same variant and message. Wrapped sources keep only their text.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::NodeExecution(m) => Error::NodeExecution(m.clone()),
            Error::InvalidTransition(m) => Error::InvalidTransition(m.clone()),
            Error::Context(m) => Error::Context(m.clone()),
            Error::Validation(m) => Error::Validation(m.clone()),
            Error::Execution(m) => Error::Execution(m.clone()),
            Error::Connection(m) => Error::Connection(m.clone()),
            Error::Llm(m) => Error::Llm(m.clone()),
            Error::MalformedOutput(m) => Error::MalformedOutput(m.clone()),
            Error::UnsupportedChart(m) => Error::UnsupportedChart(m.clone()),
            Error::Visualization(m) => Error::Visualization(m.clone()),
            Error::Cache(m) => Error::Cache(m.clone()),
            Error::InvalidInput(m) => Error::InvalidInput(m.clone()),
            Error::Config(m) => Error::Config(m.clone()),
            Error::Serialization(e) => Error::Other(e.to_string()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Other(m) => Error::Other(m.clone()),
        }
    }
}

/// Re-raises a failure seen in `post_process`, keeping the crate error type
/// when there is one.
pub(crate) fn rethrow(e: &anyhow::Error) -> anyhow::Error {
    match e.downcast_ref::<Error>() {
        Some(err) => err.duplicate().into(),
        None => anyhow::anyhow!(e.to_string()),
    }
}

#[cfg(feature = "duckdb")]
impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        Error::Execution(e.to_string())
    }
}

/// Recovers the crate error carried through a flow run, if there is one.
impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<Error>() {
            Ok(err) => err,
            Err(other) => Error::NodeExecution(other.to_string()),
        }
    }
}
