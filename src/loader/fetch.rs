//! Remote module fetching.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned a body that is not UTF-8")]
    NotUtf8 { url: String },

    #[error("fetch of {url} was interrupted")]
    Interrupted { url: String },
}

/// Source of remote module text
pub trait ModuleFetcher: Send + Sync {
    /// Fetch the full body of `url`. Any partial read is an error.
    fn fetch(&self, url: &Url) -> Result<String, FetchError>;
}

/// Blocking HTTPS fetcher
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

const READ_CHUNK: usize = 16 * 1024;

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl ModuleFetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let transport = |e: &dyn fmt::Display| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // Buffer every chunk before decoding so a multi-byte character split across
        // chunk boundaries is never mangled.
        let mut body = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = response.read(&mut chunk).map_err(|e| transport(&e))?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        debug!(%url, bytes = body.len(), "fetched remote module");
        String::from_utf8(body).map_err(|_| FetchError::NotUtf8 {
            url: url.to_string(),
        })
    }
}

/// Run a blocking fetch on a helper thread, suspending only the awaiting future.
pub async fn fetch_async(fetcher: Arc<dyn ModuleFetcher>, url: Url) -> Result<String, FetchError> {
    let (tx, rx) = oneshot::channel();
    let target = url.clone();
    thread::Builder::new()
        .name("spindle-fetch".into())
        .spawn(move || {
            let _ = tx.send(fetcher.fetch(&target));
        })
        .map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    rx.await.map_err(|_| FetchError::Interrupted {
        url: url.to_string(),
    })?
}
