//! Network probes used by the load-test engine.
//!
//! - [`tcp`] answers "is anything listening on host:port?" before a run starts.
//! - [`http`] issues the individual requests a run is made of.

pub mod http;
pub mod tcp;

use thiserror::Error;

/// Failure of a single probe. Never fatal to a run.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
}
