//! Spindle - browser-style module Workers for the Boa JS engine
//!
//! Spindle runs each `Worker` in its own Boa context on its own thread:
//! - `new Worker(url, { type: "module" })` from JavaScript, or [`Worker`] from Rust
//! - Module sources from files, `https:`, `data:` and `blob:` URLs
//! - Structured-clone messaging with `postMessage` and error events
//! - OXC transpilation for TypeScript worker modules

pub mod blob;
pub mod loader;
pub mod resolver;
pub mod runtime;
pub mod transpiler;
pub mod worker;

// Re-export commonly used types
pub use blob::BlobStore;
pub use loader::{HookApi, ModuleHooks};
pub use resolver::{ModuleResolver, ModuleSource};
pub use runtime::message::StructuredValue;
pub use runtime::{Runtime, RuntimeConfig, RuntimeError, RuntimeResult};
pub use transpiler::{TranspileError, Transpiler, TranspilerConfig};
pub use worker::events::{ErrorEvent, MessageEvent, WorkerEvent};
pub use worker::{Worker, WorkerError, WorkerOptions, WorkerType};
