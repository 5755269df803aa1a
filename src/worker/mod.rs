//! Browser-style module workers for Rust callers.
//!
//! A [`Worker`] runs an ES module on its own thread with its own Boa context and
//! exchanges structured messages with it. Rust has no ambient event loop, so
//! events are delivered when the owner calls [`Worker::poll`] or [`Worker::wait`].
//!
//! ```no_run
//! use spindle::{Worker, WorkerEvent, WorkerOptions};
//! use std::time::Duration;
//!
//! let mut worker = Worker::new("./task.js", WorkerOptions::module()).unwrap();
//! worker.set_onmessage(Some(Box::new(|event: &WorkerEvent| {
//!     if let WorkerEvent::Message(message) = event {
//!         println!("{:?}", message.data);
//!     }
//! })));
//! worker.wait(Duration::from_secs(1));
//! ```

pub mod events;
pub mod handle;

use crate::resolver::{self, ModuleSource};
use crate::runtime::RuntimeConfig;
use crate::runtime::message::{SerializedMessage, StructuredValue};
use events::{
    ErrorEvent, EventKind, EventTarget, Listener, ListenerId, ListenerOptions, MessageEvent,
    WorkerEvent,
};
use handle::{ParentEvent, WorkerHandle, WorkerSpec};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Errors raised synchronously by worker construction and messaging
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("only module sources are supported")]
    UnsupportedType,

    #[error("invalid worker script URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("value could not be cloned: {0}")]
    DataClone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerType {
    Module,
    /// Accepted by the options type so callers can ask for it, always rejected
    Classic,
}

/// Rust counterpart of the `{ type, name }` options bag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub kind: Option<WorkerType>,
    pub name: Option<String>,
}

impl WorkerOptions {
    pub fn module() -> Self {
        Self {
            kind: Some(WorkerType::Module),
            name: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::module()
        }
    }
}

fn invalid(url: &str, reason: impl Into<String>) -> WorkerError {
    WorkerError::InvalidUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}

/// Remove `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Classify a worker script URL relative to the constructing context.
///
/// Only the shape of the URL is checked here. A file that does not exist is a
/// load failure reported by the worker itself.
pub fn locate_script(
    specifier: &str,
    base_dir: &Path,
    parent: Option<&ModuleSource>,
) -> Result<ModuleSource, WorkerError> {
    if resolver::is_remote(specifier) || resolver::is_ephemeral(specifier) || resolver::is_data(specifier)
    {
        return ModuleSource::parse(specifier).ok_or_else(|| invalid(specifier, "malformed URL"));
    }
    if let Ok(url) = Url::parse(specifier) {
        return match url.scheme() {
            "file" => url
                .to_file_path()
                .map(ModuleSource::File)
                .map_err(|_| invalid(specifier, "not a local file")),
            scheme if scheme.len() > 1 => {
                Err(invalid(specifier, format!("unsupported scheme `{scheme}:`")))
            }
            // drive letters
            _ => Ok(ModuleSource::File(normalize(Path::new(specifier)))),
        };
    }
    match parent {
        Some(ModuleSource::Remote(base)) => base
            .join(specifier)
            .map(ModuleSource::Remote)
            .map_err(|e| invalid(specifier, e.to_string())),
        Some(parent) => {
            let dir = parent.directory().unwrap_or(base_dir);
            Ok(ModuleSource::File(normalize(&dir.join(specifier))))
        }
        None => Ok(ModuleSource::File(normalize(&base_dir.join(specifier)))),
    }
}

/// A module worker owned by Rust code
pub struct Worker {
    handle: Arc<WorkerHandle>,
    target: EventTarget,
}

impl Worker {
    /// Spawn a worker with the default runtime configuration
    pub fn new(script_url: &str, options: WorkerOptions) -> Result<Self, WorkerError> {
        Self::with_config(script_url, options, RuntimeConfig::default())
    }

    /// Spawn a worker; relative URLs resolve against `config.base_path`
    pub fn with_config(
        script_url: &str,
        options: WorkerOptions,
        config: RuntimeConfig,
    ) -> Result<Self, WorkerError> {
        if options.kind != Some(WorkerType::Module) {
            return Err(WorkerError::UnsupportedType);
        }
        let source = locate_script(script_url, &config.base_path, None)?;
        let handle = handle::spawn(WorkerSpec {
            source,
            name: options.name,
            config,
            owner: None,
        })?;
        Ok(Self {
            handle,
            target: EventTarget::new(),
        })
    }

    pub fn id(&self) -> handle::WorkerId {
        self.handle.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.handle.name()
    }

    /// Canonical URL of the worker's module
    pub fn url(&self) -> &str {
        self.handle.url()
    }

    /// Send a value to the worker; a no-op once it has exited
    pub fn post_message(&self, data: &StructuredValue) {
        self.post_message_with_transfer(data, Vec::new());
    }

    /// Send a value whose [`StructuredValue::Transferred`] entries index `transfer`
    pub fn post_message_with_transfer(&self, data: &StructuredValue, transfer: Vec<Vec<u8>>) {
        self.handle.post(SerializedMessage::encode(data, transfer));
    }

    /// Stop the worker. Idempotent; events not yet delivered are discarded.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    pub fn has_exited(&self) -> bool {
        self.handle.has_exited()
    }

    pub fn add_event_listener(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        self.add_event_listener_with_options(kind, listener, ListenerOptions::default())
    }

    pub fn add_event_listener_with_options(
        &mut self,
        kind: EventKind,
        listener: Listener,
        options: ListenerOptions,
    ) -> ListenerId {
        if kind == EventKind::Message {
            self.handle.arm();
        }
        self.target.add_listener(kind, listener, options)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.target.remove_listener(id)
    }

    /// Deliver `event` to this worker's listeners as if it had arrived
    pub fn dispatch_event(&mut self, event: &WorkerEvent) -> usize {
        self.target.dispatch(event)
    }

    pub fn set_onmessage(&mut self, handler: Option<Listener>) -> Option<ListenerId> {
        if handler.is_some() {
            self.handle.arm();
        }
        self.target.set_handler(EventKind::Message, handler)
    }

    pub fn onmessage(&self) -> Option<ListenerId> {
        self.target.handler(EventKind::Message)
    }

    pub fn set_onerror(&mut self, handler: Option<Listener>) -> Option<ListenerId> {
        self.target.set_handler(EventKind::Error, handler)
    }

    pub fn onerror(&self) -> Option<ListenerId> {
        self.target.handler(EventKind::Error)
    }

    /// Dispatch everything that has arrived. Returns the number of events.
    pub fn poll(&mut self) -> usize {
        let mut dispatched = 0;
        for event in self.handle.take_events() {
            let event = match event {
                ParentEvent::Message(message) => match message.decode() {
                    Ok((data, transfer)) => WorkerEvent::Message(MessageEvent { data, transfer }),
                    Err(error) => {
                        warn!(worker = self.handle.id(), %error, "undecodable message dropped");
                        continue;
                    }
                },
                ParentEvent::Error(error) => {
                    let value = match error.decode() {
                        Ok((value, _)) => value,
                        Err(decode_error) => StructuredValue::Error {
                            name: "Error".into(),
                            message: decode_error.to_string(),
                            stack: None,
                        },
                    };
                    WorkerEvent::Error(ErrorEvent::new(value))
                }
                ParentEvent::Exit(_) => continue,
            };
            self.target.dispatch(&event);
            dispatched += 1;
        }
        dispatched
    }

    /// Block until at least one event is dispatched, the worker exits, or
    /// `timeout` elapses. Returns the number of events dispatched.
    pub fn wait(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let dispatched = self.poll();
            if dispatched > 0 || self.has_exited() {
                return dispatched;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return 0;
            }
            self.handle.wait_for_events(remaining);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.terminate();
    }
}
