use thiserror::Error;

/// Network/HTTP failure for one URL. Never fatal to a batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to read response body: {0}")]
    Body(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry write failed: {0}")]
    WriteFailure(String),
    #[error("duplicate entry for {url} in run {run_id}")]
    DuplicateEntry { run_id: String, url: String },
    #[error("unknown run {0}")]
    UnknownRun(String),
    #[error("run {0} is already finalized")]
    RunClosed(String),
    #[error("registry data is corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::WriteFailure(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error on {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that abort a whole batch run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("run summary could not be written: {0}")]
    Summary(#[from] StoreError),
}
