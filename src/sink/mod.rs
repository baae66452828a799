//! Where finalized results go: a local JSON file and the remote API.
//!
//! Both are best-effort. The engine reports their errors and carries on.

pub mod api;
pub mod local;

pub use api::ApiClient;
pub use local::LocalStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid API endpoint '{0}'")]
    Endpoint(String),
}
