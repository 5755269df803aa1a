//! JavaScript runtime powered by Boa engine
//!
//! Every context, the orchestrator and each worker alike, is a [`Runtime`]:
//! one Boa `Context` with the boa_runtime web APIs, the module loader from
//! [`crate::loader`], the event and codec prelude, and the `Worker` class.
//!
//! Features provided:
//! - Console API, labelled per worker
//! - Timers (setTimeout, setInterval, clearTimeout, clearInterval)
//! - URL API, `URL.createObjectURL` and `Blob`
//! - Text encoding (TextEncoder, TextDecoder)
//! - structuredClone, queueMicrotask, fetch
//! - `Worker`, `EventTarget`, `Event`, `MessageEvent`, `ErrorEvent`
//! - ES Modules with TypeScript transpilation

pub mod bootstrap;
pub mod host;
pub mod message;
pub mod scope;
pub mod worker;

use crate::loader::adapters::HookApi;
use crate::loader::fetch::{HttpFetcher, ModuleFetcher};
use crate::loader::{DefaultHost, HookError, ModuleHooks, ModuleText, SpindleModuleLoader};
use crate::resolver::ModuleSource;
use crate::transpiler::{MediaType, Transpiler, TranspilerConfig};
use crate::worker::handle::{self as worker_handle, ContextId};
use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
    builtins::promise::PromiseState, context::ContextBuilder, js_string, module::Module,
};
use boa_gc::{Finalize, Trace};
use boa_runtime::{
    ConsoleState, Logger,
    extensions::{
        ConsoleExtension, EncodingExtension, FetchExtension, MicrotaskExtension,
        StructuredCloneExtension, TimeoutExtension, UrlExtension,
    },
    fetch::BlockingReqwestFetcher,
    register_extensions,
};
use host::HostContext;
use message::{SerializedMessage, StructuredValue};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const PRELUDE_JS: &str = include_str!("js/prelude.js");
const WORKER_JS: &str = include_str!("js/worker.js");

/// Errors that can occur during runtime execution
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Transpilation error: {0}")]
    TranspileError(#[from] crate::transpiler::TranspileError),

    #[error("Module load error: {0}")]
    ModuleError(String),

    #[error(transparent)]
    HookError(#[from] HookError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<JsError> for RuntimeError {
    fn from(error: JsError) -> Self {
        RuntimeError::JsError(error.to_string())
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Console logger that keeps lines from parallel contexts intact.
///
/// Each message is written with the stream locked and flushed at once, prefixed
/// with the context's label when it has one.
#[derive(Debug, Clone, Default, Trace, Finalize)]
pub struct SpindleLogger {
    label: Option<String>,
}

impl SpindleLogger {
    pub fn new(label: Option<String>) -> Self {
        Self { label }
    }

    fn line(&self, level: Option<&str>, msg: &str) -> String {
        let mut line = String::with_capacity(msg.len() + 16);
        if let Some(label) = &self.label {
            line.push_str(&format!("[{label}] "));
        }
        if let Some(level) = level {
            line.push_str(&format!("[{level}] "));
        }
        line.push_str(msg);
        line.push('\n');
        line
    }

    fn write(&self, mut out: impl Write, line: &str) -> JsResult<()> {
        out.write_all(line.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|e| JsNativeError::error().with_message(e.to_string()).into())
    }

    fn stdout(&self, level: Option<&str>, msg: &str) -> JsResult<()> {
        self.write(io::stdout().lock(), &self.line(level, msg))
    }

    fn stderr(&self, level: Option<&str>, msg: &str) -> JsResult<()> {
        self.write(io::stderr().lock(), &self.line(level, msg))
    }
}

impl Logger for SpindleLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.stdout(None, &msg)
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.stdout(Some("INFO"), &msg)
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.stderr(Some("WARN"), &msg)
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.stderr(Some("ERROR"), &msg)
    }
}

/// Configuration for a runtime; workers inherit their parent's
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Base path for module resolution
    pub base_path: PathBuf,
    /// Transpiler configuration
    pub transpiler_config: TranspilerConfig,
    /// Call shape used for the module hooks
    pub hook_api: HookApi,
    /// Loads `https:` modules
    pub fetcher: Arc<dyn ModuleFetcher>,
    /// Bound on waiting for a `blob:` entry; `None` waits forever
    pub resolve_timeout: Option<Duration>,
    /// Safety cap on [`Runtime::run_event_loop`]
    pub event_loop_timeout: Duration,
    /// Prefix for console output
    pub console_label: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            transpiler_config: TranspilerConfig::default(),
            hook_api: HookApi::detect(),
            fetcher: Arc::new(HttpFetcher::new()),
            resolve_timeout: Some(Duration::from_secs(10)),
            event_loop_timeout: Duration::from_secs(300),
            console_label: None,
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("base_path", &self.base_path)
            .field("transpiler_config", &self.transpiler_config)
            .field("hook_api", &self.hook_api)
            .field("resolve_timeout", &self.resolve_timeout)
            .field("event_loop_timeout", &self.event_loop_timeout)
            .field("console_label", &self.console_label)
            .finish_non_exhaustive()
    }
}

/// Call a function on the `__spindle` internals object
pub(crate) fn call_internal(
    context: &mut Context,
    method: &str,
    args: &[JsValue],
) -> JsResult<JsValue> {
    let internals = context
        .global_object()
        .get(js_string!("__spindle"), context)?;
    let internals = internals
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("runtime prelude is not installed"))?;
    let function = internals.get(JsString::from(method), context)?;
    let function = function.as_callable().map(|f| f.clone()).ok_or_else(|| {
        JsNativeError::typ().with_message(format!("__spindle.{method} is not a function"))
    })?;
    function.call(&JsValue::from(internals), args, context)
}

/// Hand an error nobody caught to the context's error reporting
pub(crate) fn report_uncaught(context: &mut Context, error: JsError) {
    let value = error.to_opaque(context);
    if let Err(report_error) = call_internal(context, "reportError", &[value]) {
        warn!(%error, %report_error, "uncaught error could not be reported");
    }
}

/// One JavaScript context with its module loader and worker support
pub struct Runtime {
    context: Context,
    host: Arc<HostContext>,
    loader: Rc<SpindleModuleLoader>,
    transpiler: Transpiler,
}

impl Runtime {
    /// Create a new runtime with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new orchestrator runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        Self::build(config, None)
    }

    /// Build a context; `module` is the entry of a worker context
    pub(crate) fn build(config: RuntimeConfig, module: Option<ModuleSource>) -> RuntimeResult<Self> {
        let base_path = module
            .as_ref()
            .and_then(ModuleSource::directory)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.base_path.clone());
        let hooks = ModuleHooks::new(Arc::clone(&config.fetcher), config.resolve_timeout);
        let loader = Rc::new(SpindleModuleLoader::new(
            hooks,
            DefaultHost::new(&base_path),
            config.hook_api,
            config.transpiler_config.clone(),
        ));

        let mut context = ContextBuilder::default()
            .module_loader(Rc::clone(&loader))
            .build()
            .map_err(|e| RuntimeError::JsError(e.to_string()))?;

        // Large module graphs need more than Boa's defaults
        context.runtime_limits_mut().set_recursion_limit(16384);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(1024 * 1024);

        register_extensions(
            (
                ConsoleExtension(SpindleLogger::new(config.console_label.clone())),
                TimeoutExtension,
                UrlExtension,
                EncodingExtension,
                StructuredCloneExtension,
                MicrotaskExtension,
                FetchExtension(BlockingReqwestFetcher::default()),
            ),
            None,
            &mut context,
        )?;

        let transpiler = Transpiler::with_config(config.transpiler_config.clone());
        let host = host::register(config, module);
        let mut runtime = Self {
            context,
            host,
            loader,
            transpiler,
        };
        runtime.install_globals()?;
        debug!(context = runtime.id(), api = %runtime.loader.api(), "runtime ready");
        Ok(runtime)
    }

    fn install_globals(&mut self) -> RuntimeResult<()> {
        let context = &mut self.context;
        host::install(context, self.host.id())?;
        Self::register_blob_natives(context)?;
        context.eval(Source::from_bytes(PRELUDE_JS.as_bytes()))?;
        worker::register_worker_api(context)?;
        context.eval(Source::from_bytes(WORKER_JS.as_bytes()))?;
        Ok(())
    }

    /// Natives behind `URL.createObjectURL` and `URL.revokeObjectURL`
    fn register_blob_natives(context: &mut Context) -> JsResult<()> {
        // __spindle_blob_register(content, type) -> url
        let register_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
            let content = args.get_or_undefined(0).to_string(context)?;
            let content_type = args.get_or_undefined(1).to_string(context)?;
            let host = host::current(context)?;
            let url = host.blobs().create_object_url(
                &content.to_std_string_escaped(),
                &content_type.to_std_string_escaped(),
            );
            Ok(JsValue::from(js_string!(url)))
        });
        context.register_global_callable(js_string!("__spindle_blob_register"), 2, register_fn)?;

        // __spindle_blob_revoke(url)
        let revoke_fn = NativeFunction::from_fn_ptr(|_this, args, context| {
            let url = args.get_or_undefined(0).to_string(context)?;
            let host = host::current(context)?;
            host.blobs().revoke_object_url(&url.to_std_string_escaped());
            Ok(JsValue::undefined())
        });
        context.register_global_callable(js_string!("__spindle_blob_revoke"), 1, revoke_fn)?;

        Ok(())
    }

    pub fn id(&self) -> ContextId {
        self.host.id()
    }

    pub(crate) fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.host.config()
    }

    /// Evaluate a script and return the result
    pub fn eval(&mut self, code: &str, filename: &str) -> RuntimeResult<JsValue> {
        let js_code = match MediaType::from_path(filename) {
            MediaType::TypeScript => self.transpiler.transpile(code, filename)?,
            _ => code.to_string(),
        };

        let source = Source::from_bytes(js_code.as_bytes());
        let result = self.context.eval(source);

        // Run any pending jobs
        if let Err(error) = self.context.run_jobs() {
            report_uncaught(&mut self.context, error);
        }

        result.map_err(RuntimeError::from)
    }

    /// Evaluate a script and convert its value to JSON; `undefined` becomes `null`
    pub fn eval_json(&mut self, code: &str) -> RuntimeResult<serde_json::Value> {
        let value = self.eval(code, "eval.js")?;
        Ok(value.to_json(&mut self.context)?.unwrap_or(serde_json::Value::Null))
    }

    /// Import `specifier` as the entry module and run until all work is done
    pub fn run_module(&mut self, specifier: &str) -> RuntimeResult<()> {
        self.import_entry(specifier)
            .map_err(|e| RuntimeError::ModuleError(e.to_string()))?;
        self.run_event_loop()
    }

    /// Import a module through the loader and wait for its evaluation
    pub fn import_entry(&mut self, url: &str) -> JsResult<()> {
        let specifier = serde_json::to_string(url)
            .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
        let stub = format!("import {specifier};");
        let module = Module::parse(Source::from_bytes(stub.as_bytes()), None, &mut self.context)?;
        let promise = module.load_link_evaluate(&mut self.context);

        let started = Instant::now();
        let max_runtime = self.config().event_loop_timeout;
        loop {
            let progressed = self.turn();
            match promise.state() {
                PromiseState::Fulfilled(_) => return Ok(()),
                PromiseState::Rejected(reason) => return Err(JsError::from_opaque(reason.clone())),
                PromiseState::Pending => {
                    if started.elapsed() > max_runtime {
                        return Err(JsNativeError::error()
                            .with_message(format!("module '{url}' did not finish evaluating"))
                            .into());
                    }
                    if !progressed {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
    }

    /// Make an already-fetched module importable under `url`
    pub(crate) fn register_prefetched(&mut self, url: &str, text: &ModuleText) -> JsResult<()> {
        self.loader.parse_module(url, text, &mut self.context)?;
        Ok(())
    }

    /// One event loop turn: run ready jobs, then deliver channel events.
    /// Returns whether any event was delivered.
    pub fn turn(&mut self) -> bool {
        if let Err(error) = self.context.run_jobs() {
            report_uncaught(&mut self.context, error);
        }
        let mut progressed = false;
        if let Some(scope) = self.host.scope().cloned() {
            for message in scope.handle().take_inbox() {
                if scope.is_closed() || scope.handle().termination_requested() {
                    break;
                }
                let payload = JsValue::from(js_string!(message.as_str().to_string()));
                if let Err(error) = call_internal(&mut self.context, "deliverToScope", &[payload]) {
                    report_uncaught(&mut self.context, error);
                }
                progressed = true;
            }
        }
        progressed |= worker::pump(&mut self.context, self.host.id());
        if progressed {
            if let Err(error) = self.context.run_jobs() {
                report_uncaught(&mut self.context, error);
            }
        }
        progressed
    }

    /// Run the event loop until all work is complete (timers, promises, workers)
    pub fn run_event_loop(&mut self) -> RuntimeResult<()> {
        let start_time = Instant::now();
        let max_runtime = self.config().event_loop_timeout;

        loop {
            // Safety: don't run forever
            if start_time.elapsed() > max_runtime {
                warn!(context = self.id(), ?max_runtime, "event loop stopped with live workers");
                break;
            }
            let progressed = self.turn();
            if !self.has_live_workers() {
                break;
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // Final cleanup run
        self.turn();
        Ok(())
    }

    /// Turn the loop until `done` holds or `timeout` elapses; returns whether
    /// `done` held
    pub fn run_event_loop_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&mut Self) -> bool,
    {
        let started = Instant::now();
        loop {
            let progressed = self.turn();
            if done(self) {
                return true;
            }
            if started.elapsed() > timeout {
                return false;
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Whether workers created by this context are still running
    pub fn has_live_workers(&self) -> bool {
        !worker_handle::owned_by(self.id()).is_empty()
    }

    /// Whether the worker scope has message listeners that keep it alive
    pub fn scope_has_listeners(&mut self) -> bool {
        if !self.host.is_worker() {
            return false;
        }
        match call_internal(&mut self.context, "scopeHasListeners", &[]) {
            Ok(value) => value.to_boolean(),
            Err(error) => {
                warn!(context = self.id(), %error, "could not inspect scope listeners");
                false
            }
        }
    }

    /// Encode a thrown value for the error channel
    pub fn serialize_error(&mut self, error: &JsError) -> SerializedMessage {
        let value = error.to_opaque(&mut self.context);
        match call_internal(&mut self.context, "encodeError", &[value]) {
            Ok(encoded) => match encoded.as_string() {
                Some(text) => SerializedMessage::from_wire(text.to_std_string_escaped()),
                None => Self::fallback_error(error),
            },
            Err(_) => Self::fallback_error(error),
        }
    }

    fn fallback_error(error: &JsError) -> SerializedMessage {
        let value = StructuredValue::Error {
            name: "Error".into(),
            message: error.to_string(),
            stack: None,
        };
        SerializedMessage::encode(&value, Vec::new())
    }

    /// Get mutable reference to the underlying context
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Get reference to the underlying context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Convert a JsValue to a displayable string
    pub fn value_to_string(&mut self, value: &JsValue) -> String {
        value
            .to_string(&mut self.context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "[error converting value]".to_string())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for child in worker_handle::owned_by(self.id()) {
            child.terminate();
            worker_handle::remove(child.id());
        }
        host::unregister(self.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::fetch::tests::StaticFetcher;
    use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(20);

    fn module_url(source: &str) -> String {
        format!(
            "data:text/javascript,{}",
            utf8_percent_encode(source, NON_ALPHANUMERIC)
        )
    }

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig {
            base_path: std::env::temp_dir(),
            ..Default::default()
        })
        .unwrap()
    }

    /// Evaluate `setup`, then turn the loop until `results` holds `count` entries
    fn results_after(runtime: &mut Runtime, setup: &str, count: usize) -> serde_json::Value {
        runtime
            .eval(&format!("globalThis.results = [];\n{setup}"), "setup.js")
            .unwrap();
        runtime.run_event_loop_until(WAIT, |rt| {
            rt.eval_json("results.length")
                .map(|n| n.as_u64() >= Some(count as u64))
                .unwrap_or(false)
        });
        runtime.eval_json("results").unwrap()
    }

    #[test]
    fn test_runtime_creation() {
        let runtime = Runtime::new();
        assert!(runtime.is_ok());
    }

    #[test]
    fn test_basic_javascript() {
        let mut runtime = runtime();
        assert_eq!(runtime.eval_json("1 + 1").unwrap(), json!(2));
    }

    #[test]
    fn test_typescript_eval() {
        let mut runtime = runtime();
        let result = runtime.eval("const x: number = 10; x * 2", "test.ts").unwrap();
        assert_eq!(result.as_number(), Some(20.0));
    }

    #[test]
    fn test_worker_requires_module_type() {
        let mut runtime = runtime();
        let value = runtime
            .eval_json(
                r#"
                const outcomes = [];
                for (const options of [undefined, {}, { type: "classic" }]) {
                    try {
                        new Worker("data:text/javascript,postMessage(1)", options);
                        outcomes.push("constructed");
                    } catch (e) {
                        outcomes.push(e instanceof TypeError && e.message);
                    }
                }
                outcomes
                "#,
            )
            .unwrap();
        let message = "only module sources are supported";
        assert_eq!(value, json!([message, message, message]));
        assert!(!runtime.has_live_workers());
    }

    #[test]
    fn test_worker_posts_number() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             w.onmessage = (e) => results.push(e.data);",
            module_url("postMessage(100)")
        );
        assert_eq!(results_after(&mut runtime, &setup, 1), json!([100]));
    }

    #[test]
    fn test_worker_error_is_error_instance() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             w.onerror = (e) => results.push([e.error instanceof ReferenceError, e.message]);",
            module_url("a + b")
        );
        let results = results_after(&mut runtime, &setup, 1);
        assert_eq!(results[0][0], json!(true));
        assert!(results[0][1].as_str().unwrap().starts_with("ReferenceError"));
    }

    #[test]
    fn test_echo_round_trip() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             w.addEventListener('message', (e) => {{ results.push(e.data); w.terminate(); }});\n\
             w.postMessage({{ greeting: 'hello' }});",
            module_url("onmessage = (e) => postMessage(['received message event', e.data]);")
        );
        assert_eq!(
            results_after(&mut runtime, &setup, 1),
            json!([["received message event", { "greeting": "hello" }]])
        );
        runtime.run_event_loop().unwrap();
        assert!(!runtime.has_live_workers());
    }

    #[test]
    fn test_undefined_survives_worker_to_owner() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             const show = (v) => (v === undefined ? 'undefined' : String(v));\n\
             w.onmessage = (e) => results.push(show(e.data));\n\
             w.onerror = (e) => results.push('err:' + show(e.error));",
            module_url("postMessage(undefined); throw undefined;")
        );
        assert_eq!(
            results_after(&mut runtime, &setup, 2),
            json!(["undefined", "err:undefined"])
        );
    }

    #[test]
    fn test_undefined_survives_owner_to_worker() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             w.onmessage = (e) => {{ results.push(e.data); w.terminate(); }};\n\
             w.postMessage(undefined);",
            module_url("onmessage = (e) => postMessage([typeof e.data, e.data === null]);")
        );
        assert_eq!(
            results_after(&mut runtime, &setup, 1),
            json!([["undefined", false]])
        );
    }

    #[test]
    fn test_event_init_keeps_explicit_undefined() {
        let mut runtime = runtime();
        let value = runtime
            .eval_json(
                r#"[
                    new MessageEvent("message", { data: undefined }).data === undefined,
                    new MessageEvent("message").data === null,
                    new ErrorEvent("error", { error: undefined }).error === undefined,
                    new ErrorEvent("error", {}).error === null,
                ]"#,
            )
            .unwrap();
        assert_eq!(value, json!([true, true, true, true]));
    }

    #[test]
    fn test_nested_worker() {
        let mut runtime = runtime();
        let inner = module_url("postMessage(3)");
        let outer = module_url(&format!(
            "const inner = new Worker({inner:?}, {{ type: 'module' }});\n\
             inner.onmessage = (evt) => postMessage(evt.data);"
        ));
        let setup = format!(
            "const w = new Worker({outer:?}, {{ type: 'module', name: 'outer' }});\n\
             w.onmessage = (e) => results.push(e.data);"
        );
        assert_eq!(results_after(&mut runtime, &setup, 1), json!([3]));
    }

    #[test]
    fn test_blob_worker() {
        let mut runtime = runtime();
        let setup = r#"
            const blob = new Blob(["postMessage(self.name)"], { type: "text/javascript" });
            const url = URL.createObjectURL(blob);
            const w = new Worker(url, { type: "module", name: "from-blob" });
            w.onmessage = (e) => results.push(e.data);
        "#;
        assert_eq!(results_after(&mut runtime, setup, 1), json!(["from-blob"]));
    }

    #[test]
    fn test_create_object_url_requires_blob() {
        let mut runtime = runtime();
        let value = runtime
            .eval_json(
                r#"
                try { URL.createObjectURL("text"); "accepted" }
                catch (e) { e instanceof TypeError }
                "#,
            )
            .unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn test_onmessage_reassignment() {
        let mut runtime = runtime();
        let setup = format!(
            "const w = new Worker({:?}, {{ type: 'module' }});\n\
             w.onmessage = () => results.push('first');\n\
             w.onmessage = (e) => results.push('second:' + e.data);",
            module_url("postMessage('x')")
        );
        assert_eq!(results_after(&mut runtime, &setup, 1), json!(["second:x"]));
        assert_eq!(runtime.eval_json("w.onmessage !== null").unwrap(), json!(true));
    }

    #[test]
    fn test_uncloneable_message_throws() {
        let mut runtime = runtime();
        let value = runtime
            .eval_json(&format!(
                "const w = new Worker({:?}, {{ type: 'module' }});\n\
                 let name;\n\
                 try {{ w.postMessage(() => 1); }} catch (e) {{ name = e.name; }}\n\
                 w.terminate();\n\
                 w.terminate();\n\
                 name",
                module_url("onmessage = () => {};")
            ))
            .unwrap();
        assert_eq!(value, json!("DataCloneError"));
    }

    #[test]
    fn test_codec_agrees_with_rust() {
        let mut runtime = runtime();
        let encoded = runtime
            .eval_json(
                r#"__spindle.encode({
                    nan: NaN, neg: -0, big: 12n, when: new Date(5),
                    pair: new Map([["k", undefined]]), bytes: new Uint8Array([1, 2]),
                    err: new RangeError("out"),
                })"#,
            )
            .unwrap();
        let wire = SerializedMessage::from_wire(encoded.as_str().unwrap().to_string());
        let (value, _) = wire.decode().unwrap();
        assert!(value.get("nan").and_then(|n| n.as_f64()).unwrap().is_nan());
        assert_eq!(value.get("big"), Some(&StructuredValue::BigInt("12".into())));
        assert_eq!(value.get("when"), Some(&StructuredValue::Date(5.0)));
        assert_eq!(
            value.get("pair"),
            Some(&StructuredValue::Map(vec![("k".into(), StructuredValue::Undefined)]))
        );
        assert_eq!(
            value.get("bytes"),
            Some(&StructuredValue::Bytes {
                kind: "Uint8Array".into(),
                data: vec![1, 2]
            })
        );
        assert!(matches!(
            value.get("err"),
            Some(StructuredValue::Error { name, message, .. }) if name == "RangeError" && message == "out"
        ));

        let from_rust = SerializedMessage::encode(&value, Vec::new());
        let revived = runtime
            .eval_json(&format!(
                "const v = __spindle.decode({:?}).data;\n\
                 [Object.is(v.neg, -0), typeof v.big, v.when instanceof Date, v.pair.has('k'), \
                  v.bytes instanceof Uint8Array, v.err instanceof RangeError]",
                from_rust.as_str()
            ))
            .unwrap();
        assert_eq!(revived, json!([true, "bigint", true, true, true, true]));
    }

    #[test]
    fn test_remote_module_through_fetcher() {
        let fetcher = StaticFetcher::with(&[
            ("https://cdn.test/app/main.js", "import { n } from './dep.ts'; globalThis.loaded = n;"),
            ("https://cdn.test/app/dep.ts", "export const n: number = 41 + 1;"),
        ]);
        let mut runtime = Runtime::with_config(RuntimeConfig {
            fetcher,
            ..Default::default()
        })
        .unwrap();
        runtime.run_module("https://cdn.test/app/main.js").unwrap();
        assert_eq!(runtime.eval_json("loaded").unwrap(), json!(42));
    }

    #[test]
    fn test_logger_labels_lines() {
        let logger = SpindleLogger::new(Some("pool".into()));
        assert_eq!(logger.line(Some("WARN"), "slow"), "[pool] [WARN] slow\n");
        assert_eq!(SpindleLogger::default().line(None, "hi"), "hi\n");
    }
}
