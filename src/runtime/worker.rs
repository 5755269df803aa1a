//! Worker API - owner side of module workers
//!
//! Native half of the `Worker` class in `js/worker.js`:
//! - `__spindle_worker_create(url, name)` starts a worker thread
//! - `__spindle_worker_post(id, payload)` queues an encoded message
//! - `__spindle_worker_terminate(id)` stops it
//! - `__spindle_worker_arm(id)` starts message delivery
//!
//! [`pump`] runs between jobs and hands worker events back to JavaScript.

use super::host;
use super::{call_internal, report_uncaught};
use crate::runtime::message::SerializedMessage;
use crate::worker::handle::{self, ContextId, ParentEvent, WorkerSpec};
use crate::worker::locate_script;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsValue, NativeFunction, js_string,
};
use tracing::{debug, trace};

fn worker_id(args: &[JsValue], context: &mut Context) -> JsResult<handle::WorkerId> {
    args.get(0)
        .ok_or_else(|| JsNativeError::typ().with_message("Missing worker ID"))?
        .to_u32(context)
}

/// Register the Worker natives on a context
pub fn register_worker_api(context: &mut Context) -> JsResult<()> {
    // __spindle_worker_create(url, name) -> worker_id
    let create_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let url = args
            .get(0)
            .ok_or_else(|| JsNativeError::typ().with_message("Missing URL"))?
            .to_string(context)?
            .to_std_string_escaped();
        let name = args.get_or_undefined(1);
        let name = if name.is_null_or_undefined() {
            None
        } else {
            Some(name.to_string(context)?.to_std_string_escaped()).filter(|n| !n.is_empty())
        };

        let host = host::current(context)?;
        let source = locate_script(&url, host.base_dir(), host.module())
            .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;

        let spec = WorkerSpec {
            source,
            name,
            config: host.config().clone(),
            owner: Some(host.id()),
        };
        let worker = handle::spawn(spec)
            .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
        let id = worker.id();
        handle::register(worker);

        Ok(JsValue::from(id))
    });
    context.register_global_callable(js_string!("__spindle_worker_create"), 2, create_fn)?;

    // __spindle_worker_post(worker_id, payload)
    let post_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let id = worker_id(args, context)?;
        let payload = args
            .get_or_undefined(1)
            .to_string(context)?
            .to_std_string_escaped();
        if let Some(worker) = handle::get(id) {
            if !worker.post(SerializedMessage::from_wire(payload)) {
                trace!(worker = id, "message to stopped worker dropped");
            }
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_worker_post"), 2, post_fn)?;

    // __spindle_worker_terminate(worker_id)
    let terminate_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let id = worker_id(args, context)?;
        if let Some(worker) = handle::remove(id) {
            worker.terminate();
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_worker_terminate"), 1, terminate_fn)?;

    // __spindle_worker_arm(worker_id)
    let arm_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
        let id = worker_id(args, context)?;
        if let Some(worker) = handle::get(id) {
            worker.arm();
        }
        Ok(JsValue::undefined())
    });
    context.register_global_callable(js_string!("__spindle_worker_arm"), 1, arm_fn)?;

    Ok(())
}

fn payload(message: &SerializedMessage) -> JsValue {
    JsValue::from(js_string!(message.as_str().to_string()))
}

/// Deliver queued events from every worker `owner` created.
///
/// Returns whether anything was delivered. Listener errors are reported on
/// the owner and do not stop delivery of the remaining events.
pub fn pump(context: &mut Context, owner: ContextId) -> bool {
    let mut delivered = false;
    for worker in handle::owned_by(owner) {
        let id = JsValue::from(worker.id());
        for event in worker.take_events() {
            let args = match &event {
                ParentEvent::Message(message) => {
                    [id.clone(), js_string!("message").into(), payload(message)]
                }
                ParentEvent::Error(error) => {
                    [id.clone(), js_string!("error").into(), payload(error)]
                }
                ParentEvent::Exit(code) => {
                    debug!(worker = worker.id(), code, "worker exited");
                    handle::remove(worker.id());
                    [id.clone(), js_string!("exit").into(), JsValue::from(*code)]
                }
            };
            if let Err(error) = call_internal(context, "deliverToWorker", &args) {
                report_uncaught(context, error);
            }
            delivered = true;
        }
    }
    delivered
}
