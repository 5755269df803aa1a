//! Reads `blob:` content from whichever context owns it.
//!
//! The requester joins the response channel, posts `{token}` on the request
//! channel and keeps the first response whose token matches. Responses for other
//! tokens are skipped, so any number of requests can be in flight at once.

use super::broadcast::{self, BroadcastChannel};
use futures_util::future::{Either, select};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub const REQUEST_CHANNEL: &str = "spindle:blob-request";
pub const RESPONSE_CHANNEL: &str = "spindle:blob-response";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no blob registered for {token}")]
    NotFound { token: String },

    #[error("blob channel closed while waiting for {token}")]
    ChannelClosed { token: String },

    #[error("failed to start blob resolver: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentResponse {
    pub token: String,
    pub content: String,
}

/// Ask every blob store for `token` and wait for the owner's answer.
///
/// There is no timeout here; wrap the future in [`with_deadline`] to bound it.
pub fn request_content(token: &str) -> impl Future<Output = Result<String, ResolveError>> + Send + 'static {
    let token = token.to_string();
    // Subscribe before posting so a fast responder cannot be missed.
    let mut responses = BroadcastChannel::join(RESPONSE_CHANNEL);
    let request = ContentRequest {
        token: token.clone(),
    };
    async move {
        match serde_json::to_value(&request) {
            Ok(message) => {
                let recipients = broadcast::publish(REQUEST_CHANNEL, message);
                debug!(%token, recipients, "requested blob content");
            }
            Err(e) => warn!(%token, "could not encode blob request: {e}"),
        }
        while let Some(message) = responses.recv().await {
            match serde_json::from_value::<ContentResponse>(message) {
                Ok(response) if response.token == token => return Ok(response.content),
                _ => continue,
            }
        }
        Err(ResolveError::ChannelClosed { token })
    }
}

/// Lets the finished side of a deadline wake the timer thread early
#[derive(Default)]
struct TimerCancel {
    done: Mutex<bool>,
    wake: Condvar,
}

impl TimerCancel {
    fn cancel(&self) {
        *self.done.lock() = true;
        self.wake.notify_all();
    }

    /// Park until `deadline` elapses or the wait is cancelled. Returns whether
    /// the deadline elapsed first.
    fn sleep(&self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        let mut done = self.done.lock();
        while !*done {
            if self.wake.wait_until(&mut done, until).timed_out() {
                return !*done;
            }
        }
        false
    }
}

/// Cancels the timer when the bounded wait ends, however it ends
struct CancelOnDrop(Arc<TimerCancel>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Start a timer thread that fires the receiver once `deadline` elapses
fn start_timer(
    deadline: Duration,
) -> Result<(Arc<TimerCancel>, oneshot::Receiver<()>, thread::JoinHandle<()>), ResolveError> {
    let cancel = Arc::new(TimerCancel::default());
    let (fire, timer) = oneshot::channel::<()>();
    let sleeper = Arc::clone(&cancel);
    let thread = thread::Builder::new()
        .name("spindle-blob-timer".into())
        .spawn(move || {
            if sleeper.sleep(deadline) {
                let _ = fire.send(());
            }
        })
        .map_err(|e| ResolveError::Spawn(e.to_string()))?;
    Ok((cancel, timer, thread))
}

/// Bound `future` by `deadline`, failing with `NotFound` for `token` when it elapses.
///
/// The timer runs on a helper thread so the future can be driven by any executor.
/// The thread exits as soon as the future settles.
pub async fn with_deadline<F>(
    token: &str,
    deadline: Option<Duration>,
    future: F,
) -> Result<String, ResolveError>
where
    F: Future<Output = Result<String, ResolveError>>,
{
    let Some(deadline) = deadline else {
        return future.await;
    };
    let (cancel, timer, _thread) = start_timer(deadline)?;
    let _cancel = CancelOnDrop(cancel);

    match select(pin!(future), timer).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => {
            warn!(%token, ?deadline, "blob request timed out");
            Err(ResolveError::NotFound {
                token: token.to_string(),
            })
        }
    }
}

/// Single-slot cell the requester blocks on until the resolver thread fills it
#[derive(Default)]
struct ResultCell {
    slot: Mutex<Option<Result<String, ResolveError>>>,
    ready: Condvar,
}

impl ResultCell {
    fn fill(&self, result: Result<String, ResolveError>) {
        *self.slot.lock() = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<String, ResolveError> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Resolve `token` without any cooperative suspension on the calling thread.
///
/// A dedicated resolver thread drives [`request_content`] and deposits the result
/// in a shared cell; the caller blocks on the cell's condition variable.
pub fn resolve_blocking(token: &str, timeout: Option<Duration>) -> Result<String, ResolveError> {
    let cell = Arc::new(ResultCell::default());
    let producer = Arc::clone(&cell);
    let request = request_content(token);
    let owned_token = token.to_string();

    thread::Builder::new()
        .name("spindle-blob-resolver".into())
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime.block_on(async {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, request)
                            .await
                            .unwrap_or(Err(ResolveError::NotFound { token: owned_token })),
                        None => request.await,
                    }
                }),
                Err(e) => Err(ResolveError::Spawn(e.to_string())),
            };
            producer.fill(result);
        })
        .map_err(|e| ResolveError::Spawn(e.to_string()))?;

    cell.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;

    #[test]
    fn test_blocking_resolve_reads_from_owning_store() {
        let store = BlobStore::new();
        let url = store.create_object_url("postMessage(1)", "text/javascript");

        let content = thread::spawn(move || resolve_blocking(&url, Some(Duration::from_secs(5))))
            .join()
            .unwrap();
        assert_eq!(content.unwrap(), "postMessage(1)");
    }

    #[test]
    fn test_other_stores_do_not_answer() {
        let _bystander = BlobStore::new();
        let owner = BlobStore::new();
        let url = owner.create_object_url("export default 7", "text/javascript");
        let _other = owner.create_object_url("export default 8", "text/javascript");

        assert_eq!(
            resolve_blocking(&url, Some(Duration::from_secs(5))).unwrap(),
            "export default 7"
        );
    }

    #[test]
    fn test_blocking_miss_times_out_as_not_found() {
        let err = resolve_blocking("blob:spindle/missing", Some(Duration::from_millis(100)))
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::NotFound {
                token: "blob:spindle/missing".into()
            }
        );
    }

    #[test]
    fn test_async_request_with_deadline() {
        let store = BlobStore::new();
        let url = store.create_object_url("hello", "text/plain");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let found = runtime.block_on(with_deadline(
            &url,
            Some(Duration::from_secs(5)),
            request_content(&url),
        ));
        assert_eq!(found.unwrap(), "hello");

        let missing = runtime.block_on(with_deadline(
            "blob:spindle/nope",
            Some(Duration::from_millis(100)),
            request_content("blob:spindle/nope"),
        ));
        assert!(matches!(missing, Err(ResolveError::NotFound { .. })));
    }

    #[test]
    fn test_settled_wait_releases_timer_thread() {
        let started = Instant::now();
        let (cancel, mut timer, thread) = start_timer(Duration::from_secs(30)).unwrap();
        drop(CancelOnDrop(cancel));
        thread.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(timer.try_recv().is_err());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let started = Instant::now();
        let found = runtime.block_on(with_deadline(
            "blob:spindle/ready",
            Some(Duration::from_secs(30)),
            async { Ok("ready".to_string()) },
        ));
        assert_eq!(found.unwrap(), "ready");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timer_fires_after_deadline() {
        let (_cancel, mut timer, thread) = start_timer(Duration::from_millis(20)).unwrap();
        thread.join().unwrap();
        assert!(timer.try_recv().is_ok());
    }

    #[test]
    fn test_revoked_url_is_not_found() {
        let store = BlobStore::new();
        let url = store.create_object_url("gone", "text/plain");
        store.revoke_object_url(&url);
        assert!(resolve_blocking(&url, Some(Duration::from_millis(100))).is_err());
    }
}
