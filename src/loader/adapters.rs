//! The two call shapes of the module hook contract.
//!
//! Older engine releases call hooks positionally and expect loads to complete
//! synchronously; newer ones pass property bags and await the load. Both shapes
//! funnel into the same [`ModuleHooks`] policy, so they behave identically.

use super::{HookError, LoadDecision, ModuleFormat, ModuleHooks, ModuleText, ResolveDecision, ResolveRequest};
use crate::resolver;
use std::fmt;
use std::str::FromStr;

/// Engine release this crate is built against
pub const ENGINE_VERSION: &str = "0.21";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookApi {
    /// `resolve(specifier, parent, next)` and a synchronous `load(url, next)`
    Positional,
    /// `resolve(specifier, context, next)` and an async `load(url, context, next)`
    PropertyBag,
}

impl HookApi {
    /// Pick the shape for the engine this crate is linked with
    pub fn detect() -> Self {
        Self::for_engine_version(ENGINE_VERSION)
    }

    /// Releases before 0.21 use positional hooks
    pub fn for_engine_version(version: &str) -> Self {
        let mut parts = version
            .trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        if major == 0 && minor < 21 {
            HookApi::Positional
        } else {
            HookApi::PropertyBag
        }
    }
}

impl Default for HookApi {
    fn default() -> Self {
        Self::detect()
    }
}

impl FromStr for HookApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "positional" => Ok(HookApi::Positional),
            "bag" | "property-bag" => Ok(HookApi::PropertyBag),
            other => Err(format!("unknown hook api `{other}` (expected `positional` or `bag`)")),
        }
    }
}

impl fmt::Display for HookApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookApi::Positional => f.write_str("positional"),
            HookApi::PropertyBag => f.write_str("bag"),
        }
    }
}

pub mod positional {
    use super::*;

    pub type NextResolve<'a> = dyn Fn(&str, Option<&str>) -> Result<String, HookError> + 'a;
    pub type NextLoad<'a> = dyn Fn(&str) -> Result<ModuleText, HookError> + 'a;

    /// `blob:` results come back wrapped in the sentinel file URL
    pub fn resolve(
        hooks: &ModuleHooks,
        specifier: &str,
        parent_url: Option<&str>,
        next: &NextResolve<'_>,
    ) -> Result<String, HookError> {
        let request = ResolveRequest {
            specifier,
            parent_url,
        };
        match hooks.decide_resolve(&request)? {
            ResolveDecision::ShortCircuit(url) if resolver::is_ephemeral(&url) => {
                Ok(resolver::wrap_ephemeral(&url))
            }
            ResolveDecision::ShortCircuit(url) => Ok(url),
            ResolveDecision::Delegate => next(specifier, parent_url),
        }
    }

    /// Completes before returning, blocking the loading thread for remote and
    /// ephemeral sources
    pub fn load(
        hooks: &ModuleHooks,
        url: &str,
        next: &NextLoad<'_>,
    ) -> Result<ModuleText, HookError> {
        match hooks.decide_load(url) {
            LoadDecision::Remote(remote) => hooks.fetch_blocking(&remote),
            LoadDecision::Ephemeral(token) => hooks.resolve_ephemeral_blocking(&token),
            LoadDecision::Delegate => next(url),
        }
    }
}

pub mod bag {
    use super::*;
    use std::future::Future;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ResolveContext {
        pub parent_url: Option<String>,
        pub conditions: Vec<String>,
    }

    impl ResolveContext {
        pub fn new(parent_url: Option<&str>) -> Self {
            Self {
                parent_url: parent_url.map(str::to_string),
                conditions: vec!["import".into(), "default".into()],
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Resolution {
        pub url: String,
        pub short_circuit: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct LoadContext {
        /// Format suggested by an earlier hook, if any
        pub format: Option<ModuleFormat>,
        pub conditions: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LoadResult {
        pub format: ModuleFormat,
        pub source: ModuleText,
        pub short_circuit: bool,
    }

    pub fn resolve<N>(
        hooks: &ModuleHooks,
        specifier: &str,
        context: &ResolveContext,
        next: N,
    ) -> Result<Resolution, HookError>
    where
        N: FnOnce(&str, &ResolveContext) -> Result<Resolution, HookError>,
    {
        let request = ResolveRequest {
            specifier,
            parent_url: context.parent_url.as_deref(),
        };
        match hooks.decide_resolve(&request)? {
            ResolveDecision::ShortCircuit(url) => Ok(Resolution {
                url,
                short_circuit: true,
            }),
            ResolveDecision::Delegate => next(specifier, context),
        }
    }

    pub async fn load<N, F>(
        hooks: &ModuleHooks,
        url: &str,
        context: &LoadContext,
        next: N,
    ) -> Result<LoadResult, HookError>
    where
        N: FnOnce(&str, &LoadContext) -> F,
        F: Future<Output = Result<LoadResult, HookError>>,
    {
        let source = match hooks.decide_load(url) {
            LoadDecision::Remote(remote) => hooks.fetch(remote).await?,
            LoadDecision::Ephemeral(token) => hooks.resolve_ephemeral(&token).await?,
            LoadDecision::Delegate => return next(url, context).await,
        };
        Ok(LoadResult {
            format: source.format(),
            source,
            short_circuit: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobStore;
    use crate::loader::DefaultHost;
    use crate::loader::fetch::tests::StaticFetcher;
    use std::time::Duration;

    fn hooks() -> ModuleHooks {
        ModuleHooks::new(
            StaticFetcher::with(&[
                ("https://cdn.test/lib/entry.js", "import './dep.js'; postMessage(1)"),
                ("https://cdn.test/lib/dep.js", "export const dep = true"),
            ]),
            Some(Duration::from_secs(5)),
        )
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    /// Run the same request through both shapes and return (positional, bag)
    fn resolve_both(specifier: &str, parent: Option<&str>) -> (String, String) {
        let hooks = hooks();
        let host = DefaultHost::new(std::env::temp_dir());
        let positional = positional::resolve(&hooks, specifier, parent, &|s, p| host.resolve(s, p))
            .unwrap();
        let bag = bag::resolve(&hooks, specifier, &bag::ResolveContext::new(parent), |s, ctx| {
            Ok(bag::Resolution {
                url: host.resolve(s, ctx.parent_url.as_deref())?,
                short_circuit: false,
            })
        })
        .unwrap();
        (positional, bag.url)
    }

    fn load_both(url: &str) -> (ModuleText, ModuleText) {
        let hooks = hooks();
        let host = DefaultHost::new(std::env::temp_dir());
        let positional = positional::load(&hooks, url, &|u| host.load(u)).unwrap();
        let bag = block_on(bag::load(&hooks, url, &bag::LoadContext::default(), |u, _| {
            let loaded = host.load(u);
            async move {
                loaded.map(|text| bag::LoadResult {
                    format: text.format(),
                    source: text,
                    short_circuit: false,
                })
            }
        }))
        .unwrap();
        (positional, bag.source)
    }

    #[test]
    fn test_detect_by_engine_version() {
        assert_eq!(HookApi::for_engine_version("0.20.1"), HookApi::Positional);
        assert_eq!(HookApi::for_engine_version("0.21"), HookApi::PropertyBag);
        assert_eq!(HookApi::for_engine_version("1.0.0"), HookApi::PropertyBag);
        assert_eq!("bag".parse::<HookApi>(), Ok(HookApi::PropertyBag));
        assert!("v8".parse::<HookApi>().is_err());
    }

    #[test]
    fn test_shapes_resolve_identically() {
        let (p, b) = resolve_both("./dep.js", Some("https://cdn.test/lib/entry.js"));
        assert_eq!(p, b);
        assert_eq!(p, "https://cdn.test/lib/dep.js");

        let (p, b) = resolve_both("data:text/javascript,1", None);
        assert_eq!(p, b);
    }

    #[test]
    fn test_positional_wraps_blob_urls() {
        let (p, b) = resolve_both("blob:spindle/123", None);
        assert_eq!(p, resolver::wrap_ephemeral("blob:spindle/123"));
        assert_eq!(b, "blob:spindle/123");
        assert_eq!(crate::loader::canonical_url(&p), b);
    }

    #[test]
    fn test_shapes_load_identically() {
        let (p, b) = load_both("https://cdn.test/lib/entry.js");
        assert_eq!(p, b);
        assert!(p.source.contains("postMessage(1)"));

        let (p, b) = load_both("data:text/javascript,postMessage(100)");
        assert_eq!(p, b);

        let store = BlobStore::new();
        let url = store.create_object_url("postMessage(3)", "text/javascript");
        let (p, b) = load_both(&resolver::wrap_ephemeral(&url));
        assert_eq!(p, b);
        assert_eq!(p.source, "postMessage(3)");
    }

    #[test]
    fn test_bag_short_circuit_flag() {
        let hooks = hooks();
        let resolution = bag::resolve(
            &hooks,
            "https://cdn.test/lib/entry.js",
            &bag::ResolveContext::new(None),
            |_, _| panic!("remote specifiers must not be delegated"),
        )
        .unwrap();
        assert!(resolution.short_circuit);
    }
}
