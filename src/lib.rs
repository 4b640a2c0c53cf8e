//! funee — a bundler and runtime for a TypeScript-family language with
//! bundle-time macros.
//!
//! The pipeline: load and parse modules on demand (disk and HTTP), build
//! the declaration graph reachable from the entry module's default export
//! (tree-shaking by construction), expand macro call sites to fixpoint
//! inside an embedded engine, emit one flat script, and optionally run it
//! against the host surface.

pub mod canonical;
pub mod closure;
pub mod emit;
pub mod error;
pub mod expand;
pub mod graph;
pub mod host;
pub mod http_loader;
pub mod loader;
pub mod macro_host;
pub mod module_index;
pub mod parse;
pub mod references;

pub use canonical::CanonicalName;
pub use error::FuneeError;
pub use http_loader::DiskHttpLoader;

use deno_core::error::AnyError;
use expand::{expand_macros, ExpandOptions};
use graph::{default_export_invocation, DeclarationGraph};
use loader::ModuleCache;
use std::time::Duration;
use swc_common::FileLoader;

/// One bundling run: entry module, module source, and macro limits.
pub struct BundleRequest {
    /// Absolute path or URL of the entry module.
    pub entry: String,
    pub file_loader: Box<dyn FileLoader + Sync + Send>,
    pub macro_iteration_limit: usize,
    pub macro_budget: Duration,
}

impl BundleRequest {
    /// A request served by the default disk + HTTP loader.
    pub fn new(entry: impl Into<String>) -> Result<Self, FuneeError> {
        let entry = entry.into();
        let loader = DiskHttpLoader::new().map_err(|e| FuneeError::ReadError {
            uri: entry.clone(),
            source: e,
        })?;
        Ok(Self::with_loader(entry, Box::new(loader)))
    }

    /// A request over a caller-supplied loader (tests, embedders).
    pub fn with_loader(
        entry: impl Into<String>,
        file_loader: Box<dyn FileLoader + Sync + Send>,
    ) -> Self {
        let defaults = ExpandOptions::default();
        Self {
            entry: entry.into(),
            file_loader,
            macro_iteration_limit: defaults.iteration_limit,
            macro_budget: defaults.budget,
        }
    }

    fn build_graph(self) -> Result<DeclarationGraph, FuneeError> {
        let cache = ModuleCache::new(self.file_loader);
        let mut graph = DeclarationGraph::build(
            &self.entry,
            default_export_invocation(),
            cache,
            host::host_binding_names(),
        )?;
        expand_macros(
            &mut graph,
            &ExpandOptions {
                iteration_limit: self.macro_iteration_limit,
                budget: self.macro_budget,
            },
        )?;
        Ok(graph)
    }

    /// Bundle to a single script: prologue, renamed declarations, and the
    /// final invocation of the entry default export.
    pub fn emit(self) -> Result<String, FuneeError> {
        emit::emit_bundle(&self.build_graph()?, host::HOST_PROLOGUE)
    }

    /// Bundle and run inside the embedded engine.
    pub fn execute(self) -> Result<(), AnyError> {
        let code = self.emit()?;
        host::run_bundle(&code)
    }
}
