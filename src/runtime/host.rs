//! Per-context records reachable from native functions.
//!
//! Natives are plain function pointers, so each context carries its id in a
//! read-only global and natives look their record up here.

use super::RuntimeConfig;
use super::scope::WorkerScope;
use crate::blob::BlobStore;
use crate::resolver::ModuleSource;
use crate::worker::handle::ContextId;
use boa_engine::{
    Context, JsNativeError, JsResult, JsValue, js_string, property::PropertyDescriptor,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};

static CONTEXT_COUNTER: AtomicU32 = AtomicU32::new(1);

static HOSTS: LazyLock<Mutex<HashMap<ContextId, Arc<HostContext>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub struct HostContext {
    id: ContextId,
    config: RuntimeConfig,
    /// Module the context was started for; `None` for an orchestrator
    module: Option<ModuleSource>,
    scope: OnceLock<Arc<WorkerScope>>,
    blobs: BlobStore,
}

impl HostContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn module(&self) -> Option<&ModuleSource> {
        self.module.as_ref()
    }

    /// Directory relative worker URLs resolve against
    pub fn base_dir(&self) -> &Path {
        self.module
            .as_ref()
            .and_then(ModuleSource::directory)
            .unwrap_or(&self.config.base_path)
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn scope(&self) -> Option<&Arc<WorkerScope>> {
        self.scope.get()
    }

    pub(crate) fn set_scope(&self, scope: Arc<WorkerScope>) -> bool {
        self.scope.set(scope).is_ok()
    }

    pub fn is_worker(&self) -> bool {
        self.scope.get().is_some()
    }
}

pub fn register(config: RuntimeConfig, module: Option<ModuleSource>) -> Arc<HostContext> {
    let host = Arc::new(HostContext {
        id: CONTEXT_COUNTER.fetch_add(1, Ordering::SeqCst),
        config,
        module,
        scope: OnceLock::new(),
        blobs: BlobStore::new(),
    });
    HOSTS.lock().insert(host.id, Arc::clone(&host));
    host
}

pub fn unregister(id: ContextId) {
    HOSTS.lock().remove(&id);
}

pub fn get(id: ContextId) -> Option<Arc<HostContext>> {
    HOSTS.lock().get(&id).cloned()
}

/// Stamp the context with its id
pub(crate) fn install(context: &mut Context, id: ContextId) -> JsResult<()> {
    context.global_object().define_property_or_throw(
        js_string!("__spindle_context_id"),
        PropertyDescriptor::builder()
            .value(JsValue::from(id))
            .writable(false)
            .enumerable(false)
            .configurable(false)
            .build(),
        context,
    )?;
    Ok(())
}

/// Record of the context a native is running in
pub fn current(context: &mut Context) -> JsResult<Arc<HostContext>> {
    let id = context
        .global_object()
        .get(js_string!("__spindle_context_id"), context)?
        .to_u32(context)?;
    get(id).ok_or_else(|| {
        JsNativeError::error()
            .with_message(format!("context {id} is not registered"))
            .into()
    })
}
