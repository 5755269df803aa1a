//! Worker thread entry point.
//!
//! Builds the worker's context, evaluates its entry module and then serves
//! the inbox until the worker is closed, terminated or has nothing left to do.

use super::message::{SerializedMessage, StructuredValue};
use super::scope::{self, WorkerScope};
use super::{Runtime, RuntimeResult};
use crate::blob::resolver::resolve_blocking;
use crate::loader::ModuleText;
use crate::resolver::ModuleSource;
use crate::worker::handle::{WorkerHandle, WorkerSpec, WorkerState};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// How long an idle-looking worker waits for mail before re-checking
const INBOX_POLL: Duration = Duration::from_millis(5);

fn error_message(name: &str, message: String) -> SerializedMessage {
    let error = StructuredValue::Error {
        name: name.into(),
        message,
        stack: None,
    };
    SerializedMessage::encode(&error, Vec::new())
}

/// Body of a worker thread; always ends by signalling exit
pub fn run(handle: Arc<WorkerHandle>, spec: WorkerSpec) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_worker(&handle, spec)));
    let code = match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            error!(worker = handle.id(), error = %e, "worker failed to start");
            handle.report_error(error_message("Error", e.to_string()));
            1
        }
        Err(_) => {
            error!(worker = handle.id(), "worker thread panicked");
            handle.report_error(error_message("Error", "worker thread panicked".into()));
            1
        }
    };
    handle.signal_exit(code);
}

fn run_worker(handle: &Arc<WorkerHandle>, spec: WorkerSpec) -> RuntimeResult<i32> {
    let WorkerSpec {
        source,
        name,
        mut config,
        ..
    } = spec;

    // Blob content must be fetched before its creator can revoke it
    let prefetched = match &source {
        ModuleSource::Ephemeral(token) => match resolve_blocking(token, config.resolve_timeout) {
            Ok(text) => Some(ModuleText::javascript(text)),
            Err(e) => {
                handle.report_error(error_message("Error", e.to_string()));
                return Ok(1);
            }
        },
        _ => None,
    };

    config.console_label = Some(handle.label());
    let url = source.to_string();
    let mut runtime = Runtime::build(config, Some(source))?;
    let scope = Arc::new(WorkerScope::new(
        Arc::clone(handle),
        name.unwrap_or_default(),
        url.clone(),
    ));
    scope::install(&mut runtime, Arc::clone(&scope))?;

    if let Some(text) = &prefetched {
        runtime.register_prefetched(&url, text)?;
    }

    if let Err(e) = runtime.import_entry(&url) {
        debug!(worker = handle.id(), error = %e, "entry module failed");
        let error = runtime.serialize_error(&e);
        handle.report_error(error);
        return Ok(1);
    }
    handle.set_state(WorkerState::Running);

    loop {
        if handle.termination_requested() || scope.is_closed() {
            break;
        }
        let progressed = runtime.turn();
        if scope.is_closed() {
            break;
        }
        let idle = !progressed
            && handle.inbox_is_empty()
            && !runtime.scope_has_listeners()
            && !runtime.has_live_workers();
        if idle {
            debug!(worker = handle.id(), "worker has no more work");
            break;
        }
        if !progressed {
            handle.wait_for_inbox(INBOX_POLL);
        }
    }

    handle.set_state(WorkerState::Closing);
    Ok(0)
}
