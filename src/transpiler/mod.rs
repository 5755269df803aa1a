//! Module media types and TypeScript stripping using OXC
//!
//! Worker modules may be JavaScript, TypeScript or JSON. TypeScript is turned into
//! plain JavaScript with the OXC parser, transformer and code generator; JSON is
//! wrapped into a module with a single default export.

use oxc_allocator::Allocator;
use oxc_codegen::{Codegen, CodegenOptions};
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::SourceType;
use oxc_transformer::{TransformOptions, Transformer};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur during TypeScript transpilation
#[derive(Error, Debug)]
pub enum TranspileError {
    #[error("Failed to parse TypeScript: {0}")]
    ParseError(String),

    #[error("Failed to transform TypeScript: {0}")]
    TransformError(String),

    #[error("Invalid JSON module: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for transpilation operations
pub type TranspileResult<T> = Result<T, TranspileError>;

/// What kind of source text a module holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    JavaScript,
    TypeScript,
    Json,
}

impl MediaType {
    /// Guess from a file name or URL path; unknown extensions are JavaScript
    pub fn from_path(path: &str) -> Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("ts" | "mts" | "cts") => MediaType::TypeScript,
            Some("json") => MediaType::Json,
            _ => MediaType::JavaScript,
        }
    }
}

/// Configuration for the TypeScript transpiler
#[derive(Debug, Clone, Default)]
pub struct TranspilerConfig {
    /// Whether to minify the output
    pub minify: bool,
}

/// Turns any supported media type into JavaScript module source
pub struct Transpiler {
    config: TranspilerConfig,
}

impl Transpiler {
    pub fn new() -> Self {
        Self::with_config(TranspilerConfig::default())
    }

    pub fn with_config(config: TranspilerConfig) -> Self {
        Self { config }
    }

    /// Produce module source for `source`; `name` is only used for diagnostics
    pub fn to_module_source(
        &self,
        source: &str,
        media_type: MediaType,
        name: &str,
    ) -> TranspileResult<String> {
        match media_type {
            MediaType::JavaScript => Ok(source.to_string()),
            MediaType::TypeScript => self.transpile(source, name),
            MediaType::Json => {
                let value: serde_json::Value = serde_json::from_str(source)?;
                Ok(format!("export default {value};"))
            }
        }
    }

    /// Strip TypeScript syntax from a module
    pub fn transpile(&self, source: &str, name: &str) -> TranspileResult<String> {
        let allocator = Allocator::default();
        let source_type = SourceType::ts();

        let parser_return = Parser::new(&allocator, source, source_type).parse();
        if !parser_return.errors.is_empty() {
            let error_messages: Vec<String> = parser_return
                .errors
                .iter()
                .map(|e| e.to_string())
                .collect();
            return Err(TranspileError::ParseError(error_messages.join("\n")));
        }
        let mut program = parser_return.program;

        let semantic_ret = SemanticBuilder::new().build(&program);
        for error in &semantic_ret.errors {
            warn!(module = name, "{error}");
        }
        let scoping = semantic_ret.semantic.into_scoping();

        let transform_options = TransformOptions::default();
        let transformer_return = Transformer::new(&allocator, Path::new(name), &transform_options)
            .build_with_scoping(scoping, &mut program);
        if !transformer_return.errors.is_empty() {
            let error_messages: Vec<String> = transformer_return
                .errors
                .iter()
                .map(|e| e.to_string())
                .collect();
            return Err(TranspileError::TransformError(error_messages.join("\n")));
        }

        let codegen_options = CodegenOptions {
            minify: self.config.minify,
            ..Default::default()
        };
        Ok(Codegen::new()
            .with_options(codegen_options)
            .build(&program)
            .code)
    }
}

impl Default for Transpiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_stripped() {
        let transpiler = Transpiler::new();
        let ts_code = r#"
            interface Greeting { text: string }
            const message: Greeting = { text: "hello" };
            postMessage(message.text as string);
        "#;

        let js_code = transpiler
            .to_module_source(ts_code, MediaType::TypeScript, "worker.ts")
            .unwrap();
        assert!(!js_code.contains("interface"));
        assert!(!js_code.contains(": Greeting"));
        assert!(js_code.contains("postMessage"));
    }

    #[test]
    fn test_javascript_passes_through() {
        let transpiler = Transpiler::new();
        let out = transpiler
            .to_module_source("postMessage(100)", MediaType::JavaScript, "w.js")
            .unwrap();
        assert_eq!(out, "postMessage(100)");
    }

    #[test]
    fn test_json_becomes_default_export() {
        let transpiler = Transpiler::new();
        let out = transpiler
            .to_module_source(r#"{"a": [1, 2]}"#, MediaType::Json, "data.json")
            .unwrap();
        assert_eq!(out, r#"export default {"a":[1,2]};"#);
        assert!(transpiler.to_module_source("{", MediaType::Json, "bad.json").is_err());
    }

    #[test]
    fn test_media_type_from_path() {
        assert_eq!(MediaType::from_path("/a/b.ts"), MediaType::TypeScript);
        assert_eq!(MediaType::from_path("https://x.test/m.MTS"), MediaType::TypeScript);
        assert_eq!(MediaType::from_path("config.json"), MediaType::Json);
        assert_eq!(MediaType::from_path("worker.mjs"), MediaType::JavaScript);
    }

    #[test]
    fn test_parse_errors_are_reported() {
        let transpiler = Transpiler::new();
        assert!(matches!(
            transpiler.transpile("const x: = ;", "broken.ts"),
            Err(TranspileError::ParseError(_))
        ));
    }
}
