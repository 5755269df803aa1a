//! Dedicated worker global scope.
//!
//! [`WorkerScope`] is the capability a worker context holds over its paired
//! channel. The JavaScript half (`js/scope.js`) makes the global object look
//! like a worker global: `self`, `name`, `postMessage`, `close` and the event
//! target surface.

use super::host;
use super::message::SerializedMessage;
use super::{Runtime, RuntimeError, RuntimeResult};
use crate::worker::handle::WorkerHandle;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsValue, NativeFunction, Source, js_string,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const SCOPE_JS: &str = include_str!("js/scope.js");

pub struct WorkerScope {
    handle: Arc<WorkerHandle>,
    name: String,
    url: String,
    closed: AtomicBool,
}

impl WorkerScope {
    pub fn new(handle: Arc<WorkerHandle>, name: String, url: String) -> Self {
        Self {
            handle,
            name,
            url,
            closed: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Latch the scope closed; the worker stops after the current task
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(worker = self.handle.id(), "worker scope closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn current_scope(context: &mut Context) -> JsResult<Arc<WorkerScope>> {
    let host = host::current(context)?;
    host.scope().cloned().ok_or_else(|| {
        JsNativeError::error()
            .with_message("not running inside a worker")
            .into()
    })
}

fn payload_arg(args: &[JsValue], context: &mut Context) -> JsResult<SerializedMessage> {
    let payload = args.get_or_undefined(0).to_string(context)?;
    Ok(SerializedMessage::from_wire(payload.to_std_string_escaped()))
}

fn register_natives(context: &mut Context) -> JsResult<()> {
    // __spindle_scope_post(payload)
    let post_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let scope = current_scope(context)?;
        let message = payload_arg(args, context)?;
        if !scope.is_closed() {
            scope.handle.send_to_parent(message);
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_scope_post"), 1, post_fn)?;

    // __spindle_scope_close()
    let close_fn = NativeFunction::from_fn_ptr(|_this, _args, context| {
        current_scope(context)?.close();
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_scope_close"), 0, close_fn)?;

    // __spindle_scope_error(payload): an uncaught error the scope did not handle
    let error_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let scope = current_scope(context)?;
        let error = payload_arg(args, context)?;
        scope.handle.report_error(error);
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_scope_error"), 1, error_fn)?;

    Ok(())
}

/// Turn `runtime` into the global scope of the worker behind `scope`
pub fn install(runtime: &mut Runtime, scope: Arc<WorkerScope>) -> RuntimeResult<()> {
    let name = scope.name.clone();
    runtime.host().set_scope(scope);

    let context = runtime.context_mut();
    register_natives(context)?;
    let installer = context.eval(Source::from_bytes(SCOPE_JS.as_bytes()))?;
    let installer = installer
        .as_callable()
        .map(|f| f.clone())
        .ok_or_else(|| RuntimeError::JsError("scope installer is not callable".into()))?;
    installer.call(
        &JsValue::undefined(),
        &[JsValue::from(js_string!(name))],
        context,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::resolver::ModuleSource;
    use crate::worker::handle::ParentEvent;

    fn worker_runtime() -> (Runtime, Arc<WorkerScope>) {
        let source = ModuleSource::Data("data:text/javascript,".into());
        let mut runtime = Runtime::build(RuntimeConfig::default(), Some(source)).unwrap();
        let handle = WorkerHandle::new(None, "test.js".into(), None);
        let scope = Arc::new(WorkerScope::new(handle, "scoped".into(), "test.js".into()));
        install(&mut runtime, Arc::clone(&scope)).unwrap();
        (runtime, scope)
    }

    #[test]
    fn test_scope_globals() {
        let (mut runtime, _scope) = worker_runtime();
        let value = runtime
            .eval_json("[self === globalThis, name, typeof postMessage, typeof close, onmessage]")
            .unwrap();
        assert_eq!(value, serde_json::json!([true, "scoped", "function", "function", null]));
    }

    #[test]
    fn test_close_latches_scope() {
        let (mut runtime, scope) = worker_runtime();
        assert!(!scope.is_closed());
        runtime.eval("close()", "close.js").unwrap();
        assert!(scope.is_closed());
    }

    #[test]
    fn test_listener_errors_reach_scope_onerror() {
        let (mut runtime, _scope) = worker_runtime();
        let value = runtime
            .eval_json(
                r#"
                const seen = [];
                onerror = (event) => { seen.push(event.message); return true; };
                addEventListener("message", () => { throw new TypeError("bad"); });
                dispatchEvent(new MessageEvent("message", { data: 1 }));
                seen
                "#,
            )
            .unwrap();
        assert_eq!(value, serde_json::json!(["TypeError: bad"]));
    }

    #[test]
    fn test_post_message_reaches_owner() {
        let (mut runtime, scope) = worker_runtime();
        scope.handle().arm();
        runtime.eval("postMessage({ n: 1 })", "post.js").unwrap();
        let events = scope.handle().take_events();
        assert_eq!(events.len(), 1);
        let ParentEvent::Message(message) = &events[0] else {
            panic!("expected a message, got {events:?}");
        };
        let (data, _) = message.decode().unwrap();
        assert_eq!(data.get("n").and_then(|n| n.as_f64()), Some(1.0));

        runtime.eval("close(); postMessage(2)", "post.js").unwrap();
        assert!(scope.handle().take_events().is_empty());
    }
}
