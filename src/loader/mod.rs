//! Module resolution and loading for every context.
//!
//! [`ModuleHooks`] holds the one resolve/load policy for the non-file schemes
//! (`https:`, `blob:`). Everything the policy does not claim is delegated to
//! [`DefaultHost`]. The policy is reached through one of the two call shapes in
//! [`adapters`], and [`SpindleModuleLoader`] plugs the chosen shape into Boa.

pub mod adapters;
pub mod data_url;
pub mod fetch;

use crate::blob::resolver::{self as blob_resolver, ResolveError};
use crate::resolver::{self, ModuleResolver, ModuleSource, ResolverError};
use crate::transpiler::{MediaType, TranspileError, Transpiler, TranspilerConfig};
pub use adapters::HookApi;
use adapters::{bag, positional};
use boa_engine::{
    Context, JsNativeError, JsResult, JsString, Module, Source,
    module::{ModuleLoader, Referrer},
};
use data_url::{DataUrl, DataUrlError};
use fetch::{FetchError, ModuleFetcher};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Errors raised while resolving or loading a module
#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    Resolve(#[from] ResolverError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Ephemeral(#[from] ResolveError),

    #[error("invalid data: URL: {0}")]
    DataUrl(#[from] DataUrlError),

    #[error("cannot read module {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Transpile(#[from] TranspileError),

    #[error("cannot resolve '{specifier}' against '{parent}'")]
    InvalidRelative { specifier: String, parent: String },

    #[error("no loader for module URL '{0}'")]
    Unsupported(String),
}

/// How a loaded module's source must be evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    Module,
    Json,
}

/// Raw module text and its media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleText {
    pub source: String,
    pub media_type: MediaType,
}

impl ModuleText {
    pub fn javascript(source: String) -> Self {
        Self {
            source,
            media_type: MediaType::JavaScript,
        }
    }

    pub fn format(&self) -> ModuleFormat {
        match self.media_type {
            MediaType::Json => ModuleFormat::Json,
            _ => ModuleFormat::Module,
        }
    }
}

/// Version-agnostic resolve input
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub specifier: &'a str,
    pub parent_url: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveDecision {
    ShortCircuit(String),
    Delegate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadDecision {
    Remote(Url),
    Ephemeral(String),
    Delegate,
}

/// Resolve/load policy for remote and ephemeral modules
#[derive(Clone)]
pub struct ModuleHooks {
    fetcher: Arc<dyn ModuleFetcher>,
    resolve_timeout: Option<Duration>,
}

impl ModuleHooks {
    pub fn new(fetcher: Arc<dyn ModuleFetcher>, resolve_timeout: Option<Duration>) -> Self {
        Self {
            fetcher,
            resolve_timeout,
        }
    }

    pub fn decide_resolve(&self, request: &ResolveRequest<'_>) -> Result<ResolveDecision, HookError> {
        let ResolveRequest {
            specifier,
            parent_url,
        } = *request;
        if resolver::is_remote(specifier) {
            return Ok(ResolveDecision::ShortCircuit(specifier.to_string()));
        }
        if let Some(parent) = parent_url.filter(|p| resolver::is_remote(p)) {
            let joined = Url::parse(parent)
                .and_then(|base| base.join(specifier))
                .map_err(|_| HookError::InvalidRelative {
                    specifier: specifier.to_string(),
                    parent: parent.to_string(),
                })?;
            return Ok(ResolveDecision::ShortCircuit(joined.into()));
        }
        if resolver::is_ephemeral(specifier) {
            return Ok(ResolveDecision::ShortCircuit(specifier.to_string()));
        }
        Ok(ResolveDecision::Delegate)
    }

    pub fn decide_load(&self, url: &str) -> LoadDecision {
        match ModuleSource::parse(url) {
            Some(ModuleSource::Remote(url)) => LoadDecision::Remote(url),
            Some(ModuleSource::Ephemeral(token)) => LoadDecision::Ephemeral(token),
            _ => LoadDecision::Delegate,
        }
    }

    pub(crate) fn fetch_blocking(&self, url: &Url) -> Result<ModuleText, HookError> {
        debug!(%url, "loading remote module");
        Ok(ModuleText {
            source: self.fetcher.fetch(url)?,
            media_type: MediaType::from_path(url.path()),
        })
    }

    pub(crate) async fn fetch(&self, url: Url) -> Result<ModuleText, HookError> {
        debug!(%url, "loading remote module");
        let media_type = MediaType::from_path(url.path());
        let source = fetch::fetch_async(Arc::clone(&self.fetcher), url).await?;
        Ok(ModuleText { source, media_type })
    }

    pub(crate) fn resolve_ephemeral_blocking(&self, token: &str) -> Result<ModuleText, HookError> {
        let source = blob_resolver::resolve_blocking(token, self.resolve_timeout)?;
        Ok(ModuleText::javascript(source))
    }

    pub(crate) async fn resolve_ephemeral(&self, token: &str) -> Result<ModuleText, HookError> {
        let request = blob_resolver::request_content(token);
        let source = blob_resolver::with_deadline(token, self.resolve_timeout, request).await?;
        Ok(ModuleText::javascript(source))
    }
}

/// The host's own resolution and loading, used for everything the hooks decline
pub struct DefaultHost {
    resolver: ModuleResolver,
}

impl DefaultHost {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            resolver: ModuleResolver::new(base_path),
        }
    }

    pub fn resolve(&self, specifier: &str, parent_url: Option<&str>) -> Result<String, HookError> {
        let parent = parent_url.and_then(ModuleSource::parse);
        Ok(self.resolver.resolve(specifier, parent.as_ref())?.to_string())
    }

    pub fn load(&self, url: &str) -> Result<ModuleText, HookError> {
        match ModuleSource::parse(url) {
            Some(ModuleSource::File(path)) => {
                let source = std::fs::read_to_string(&path).map_err(|source| HookError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(ModuleText {
                    source,
                    media_type: MediaType::from_path(&path.to_string_lossy()),
                })
            }
            Some(ModuleSource::Data(url)) => {
                let data = DataUrl::parse(&url)?;
                let media_type = if data.is_typescript() {
                    MediaType::TypeScript
                } else if data.is_json() {
                    MediaType::Json
                } else {
                    MediaType::JavaScript
                };
                Ok(ModuleText {
                    source: data.body,
                    media_type,
                })
            }
            _ => Err(HookError::Unsupported(url.to_string())),
        }
    }
}

/// Cache key shared by every spelling of the same module URL
pub fn canonical_url(url: &str) -> String {
    ModuleSource::parse(url)
        .map(|source| source.to_string())
        .unwrap_or_else(|| url.to_string())
}

fn to_js_error(error: impl std::fmt::Display) -> boa_engine::JsError {
    JsNativeError::error().with_message(error.to_string()).into()
}

/// Boa module loader driving the hooks through the configured adapter
pub struct SpindleModuleLoader {
    hooks: ModuleHooks,
    host: DefaultHost,
    api: HookApi,
    transpiler: Transpiler,
    cache: RefCell<HashMap<String, Module>>,
}

impl SpindleModuleLoader {
    pub fn new(
        hooks: ModuleHooks,
        host: DefaultHost,
        api: HookApi,
        transpiler_config: TranspilerConfig,
    ) -> Self {
        Self {
            hooks,
            host,
            api,
            transpiler: Transpiler::with_config(transpiler_config),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn api(&self) -> HookApi {
        self.api
    }

    pub fn resolve_url(&self, specifier: &str, parent_url: Option<&str>) -> Result<String, HookError> {
        match self.api {
            HookApi::Positional => {
                positional::resolve(&self.hooks, specifier, parent_url, &|s, p| {
                    self.host.resolve(s, p)
                })
            }
            HookApi::PropertyBag => {
                let context = bag::ResolveContext::new(parent_url);
                let resolution = bag::resolve(&self.hooks, specifier, &context, |s, ctx| {
                    Ok(bag::Resolution {
                        url: self.host.resolve(s, ctx.parent_url.as_deref())?,
                        short_circuit: false,
                    })
                })?;
                Ok(resolution.url)
            }
        }
    }

    pub async fn load_text(&self, url: &str) -> Result<ModuleText, HookError> {
        match self.api {
            HookApi::Positional => positional::load(&self.hooks, url, &|u| self.host.load(u)),
            HookApi::PropertyBag => {
                let context = bag::LoadContext::default();
                let result = bag::load(&self.hooks, url, &context, |u, _| {
                    let loaded = self.host.load(u);
                    async move {
                        loaded.map(|text| bag::LoadResult {
                            format: text.format(),
                            source: text,
                            short_circuit: false,
                        })
                    }
                })
                .await?;
                Ok(result.source)
            }
        }
    }

    /// Turn loaded text into a parsed module registered under `url`
    pub fn parse_module(&self, url: &str, text: &ModuleText, context: &mut Context) -> JsResult<Module> {
        let key = canonical_url(url);
        let js_code = self
            .transpiler
            .to_module_source(&text.source, text.media_type, &key)
            .map_err(to_js_error)?;
        let path = ModuleSource::parse(&key)
            .map(|s| s.source_path())
            .unwrap_or_else(|| PathBuf::from(&key));
        let source = Source::from_bytes(js_code.as_bytes()).with_path(&path);
        let module = Module::parse(source, None, context)?;
        self.cache.borrow_mut().insert(key, module.clone());
        Ok(module)
    }

    fn cached(&self, url: &str) -> Option<Module> {
        self.cache.borrow().get(&canonical_url(url)).cloned()
    }
}

impl ModuleLoader for SpindleModuleLoader {
    fn load_imported_module(
        self: Rc<Self>,
        referrer: Referrer,
        specifier: JsString,
        context: &RefCell<&mut Context>,
    ) -> impl std::future::Future<Output = JsResult<Module>> {
        let specifier = specifier.to_std_string_escaped();

        async move {
            let parent_url = referrer
                .path()
                .map(|p| canonical_url(&p.to_string_lossy()));
            let url = self
                .resolve_url(&specifier, parent_url.as_deref())
                .map_err(to_js_error)?;
            if let Some(module) = self.cached(&url) {
                return Ok(module);
            }

            let text = self.load_text(&url).await.map_err(to_js_error)?;
            let mut ctx = context.borrow_mut();
            self.parse_module(&url, &text, &mut ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::loader::fetch::tests::StaticFetcher;
    use std::fs;

    fn hooks() -> ModuleHooks {
        ModuleHooks::new(
            StaticFetcher::with(&[("https://cdn.test/lib/mod.js", "export default 1")]),
            Some(Duration::from_secs(5)),
        )
    }

    fn request<'a>(specifier: &'a str, parent_url: Option<&'a str>) -> ResolveRequest<'a> {
        ResolveRequest {
            specifier,
            parent_url,
        }
    }

    #[test]
    fn test_resolve_policy_order() {
        let hooks = hooks();
        assert_eq!(
            hooks.decide_resolve(&request("https://cdn.test/a.js", None)).unwrap(),
            ResolveDecision::ShortCircuit("https://cdn.test/a.js".into())
        );
        assert_eq!(
            hooks
                .decide_resolve(&request("./dep.js", Some("https://cdn.test/lib/mod.js")))
                .unwrap(),
            ResolveDecision::ShortCircuit("https://cdn.test/lib/dep.js".into())
        );
        assert_eq!(
            hooks.decide_resolve(&request("blob:spindle/1", Some("/tmp/main.js"))).unwrap(),
            ResolveDecision::ShortCircuit("blob:spindle/1".into())
        );
        assert_eq!(
            hooks.decide_resolve(&request("./local.js", Some("/tmp/main.js"))).unwrap(),
            ResolveDecision::Delegate
        );
        assert_eq!(
            hooks.decide_resolve(&request("data:text/javascript,1", None)).unwrap(),
            ResolveDecision::Delegate
        );
    }

    #[test]
    fn test_load_policy_recognizes_sentinel() {
        let hooks = hooks();
        let wrapped = resolver::wrap_ephemeral("blob:spindle/xyz");
        assert_eq!(
            hooks.decide_load(&wrapped),
            LoadDecision::Ephemeral("blob:spindle/xyz".into())
        );
        assert!(matches!(
            hooks.decide_load("https://cdn.test/lib/mod.js"),
            LoadDecision::Remote(_)
        ));
        assert_eq!(hooks.decide_load("/tmp/x.js"), LoadDecision::Delegate);
    }

    #[test]
    fn test_default_host_loads_files_and_data() {
        let dir = std::env::temp_dir().join("spindle-default-host");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("typed.ts"), "export const n: number = 1;").unwrap();

        let host = DefaultHost::new(&dir);
        let url = host.resolve("./typed", None).unwrap();
        let text = host.load(&url).unwrap();
        assert_eq!(text.media_type, MediaType::TypeScript);

        let data = host.load("data:text/javascript,postMessage(100)").unwrap();
        assert_eq!(data, ModuleText::javascript("postMessage(100)".into()));

        assert!(matches!(
            host.load("https://cdn.test/x.js"),
            Err(HookError::Unsupported(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let host = DefaultHost::new(std::env::temp_dir());
        assert!(host.load("/definitely/not/here/worker.js").is_err());
    }

    #[test]
    fn test_canonical_url_merges_sentinel() {
        let wrapped = resolver::wrap_ephemeral("blob:spindle/abc");
        assert_eq!(canonical_url(&wrapped), "blob:spindle/abc");
        assert_eq!(canonical_url("blob:spindle/abc"), "blob:spindle/abc");
    }

    #[test]
    fn test_ephemeral_load_through_hooks() {
        let store = BlobStore::new();
        let url = store.create_object_url("postMessage(2)", "text/javascript");
        let text = hooks().resolve_ephemeral_blocking(&url).unwrap();
        assert_eq!(text.source, "postMessage(2)");
    }
}
