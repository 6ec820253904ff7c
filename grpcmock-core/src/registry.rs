use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use prost_reflect::{DescriptorPool, FileDescriptor, MessageDescriptor, MethodDescriptor};
use protox::file::{ChainFileResolver, File, FileResolver, GoogleFileResolver};
use protox::Compiler;

use crate::error::Result;

/// Transforms raw `.proto` definitions into fully linked descriptors.
///
/// Workflow:
///   1) Ingest `.proto` sources into memory.
///   2) Compile sources into file descriptors, resolving imports
///      (including well-known types).
///   3) Index the descriptors so reflection and dispatch can look them up
///      by filename, message full-name, or full method path.
///
/// Usage patterns:
///   - Quick load: [`DescriptorRegistry::register_proto_file`] ingests,
///     compiles, and registers a single file in one call.
///   - Batch processing: [`DescriptorRegistry::ingest`] multiple files
///     first, then [`DescriptorRegistry::compile_and_register`] them all
///     together.
///
/// Descriptor handles returned by the lookup methods are immutable and
/// remain valid for the process lifetime.
pub struct DescriptorRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    /// Raw `.proto` sources keyed by canonical import path.
    sources: HashMap<String, String>,
    /// Ingest order, first-seen; re-ingesting does not duplicate an entry.
    source_order: Vec<String>,

    /// Every file descriptor available for reflection, first-registered first.
    files: Vec<FileDescriptor>,
    file_paths: HashSet<String>,

    /// Top-level message full-names, first-writer-wins.
    messages: HashMap<String, MessageDescriptor>,
    /// `"/<package>.<Service>/<Method>"` keys, last-writer-wins.
    methods: HashMap<String, MethodDescriptor>,
}

impl DescriptorRegistry {
    /// Create a registry preloaded with the reflection protocol's own
    /// descriptors, so `ListServices` reports the reflection services
    /// alongside user-registered ones.
    pub fn new() -> Self {
        let registry = DescriptorRegistry {
            inner: RwLock::new(RegistryState::default()),
        };
        for set in [
            tonic_reflection::pb::v1::FILE_DESCRIPTOR_SET,
            tonic_reflection::pb::v1alpha::FILE_DESCRIPTOR_SET,
        ] {
            if let Ok(pool) = DescriptorPool::decode(set) {
                let mut state = registry.inner.write().expect("registry lock poisoned");
                state.register_pool(&pool);
            }
        }
        registry
    }

    /// Store a source by canonical import path without compiling.
    ///
    /// Overwriting replaces the content; the filename keeps its original
    /// position in the ingest order.
    pub fn ingest(&self, filename: &str, content: &str) {
        let mut state = self.inner.write().expect("registry lock poisoned");
        if !state.sources.contains_key(filename) {
            state.source_order.push(filename.to_string());
        }
        state.sources.insert(filename.to_string(), content.to_string());
    }

    /// Compile every ingested source in one batch and extend the descriptor
    /// indices with the result.
    ///
    /// Imports are resolved against the ingested sources first, falling back
    /// to the bundled well-known types. A failure leaves the ingested
    /// sources and the existing indices untouched, so the operator can
    /// submit a correction and re-compile.
    pub fn compile_and_register(&self) -> Result<()> {
        let mut state = self.inner.write().expect("registry lock poisoned");

        let mut resolver = ChainFileResolver::new();
        resolver.add(MemorySourceResolver {
            sources: state.sources.clone(),
        });
        resolver.add(GoogleFileResolver::new());

        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler.include_imports(true);
        compiler.open_files(state.source_order.clone())?;
        let pool = compiler.descriptor_pool();

        state.register_pool(&pool);
        tracing::info!(
            files = state.files.len(),
            methods = state.methods.len(),
            "descriptor registry compiled"
        );
        Ok(())
    }

    /// Ingest a single file and immediately compile and register.
    pub fn register_proto_file(&self, filename: &str, content: &str) -> Result<()> {
        self.ingest(filename, content);
        self.compile_and_register()
    }

    /// Retrieve a top-level message descriptor by full name.
    pub fn message_descriptor(&self, full_name: &str) -> Option<MessageDescriptor> {
        let state = self.inner.read().expect("registry lock poisoned");
        state.messages.get(full_name).cloned()
    }

    /// Retrieve a method descriptor by full method path
    /// (`"/<package>.<Service>/<Method>"`).
    pub fn method_descriptor(&self, method_path: &str) -> Option<MethodDescriptor> {
        let state = self.inner.read().expect("registry lock poisoned");
        state.methods.get(method_path).cloned()
    }

    /// A consistent snapshot of every registered file descriptor.
    pub fn file_descriptors(&self) -> Vec<FileDescriptor> {
        let state = self.inner.read().expect("registry lock poisoned");
        state.files.clone()
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryState {
    /// Walk a compiled pool and extend the indices.
    ///
    /// Files already present (by path) keep their original descriptor, so
    /// reflection answers stay stable across re-compiles. Message names are
    /// first-writer-wins; method paths are last-writer-wins to allow hot
    /// redefinition.
    fn register_pool(&mut self, pool: &DescriptorPool) {
        for fd in pool.files() {
            if self.file_paths.insert(fd.name().to_string()) {
                self.files.push(fd.clone());
            }

            for md in fd.messages() {
                if !self.messages.contains_key(md.full_name()) {
                    tracing::debug!(name = md.full_name(), "message descriptor registered");
                    self.messages.insert(md.full_name().to_string(), md.clone());
                }
            }

            for svc in fd.services() {
                for method in svc.methods() {
                    let path = format!("/{}/{}", svc.full_name(), method.name());
                    tracing::debug!(method = %path, "method descriptor registered");
                    self.methods.insert(path, method.clone());
                }
            }
        }
    }
}

/// Serves ingested sources to the compiler by import path.
struct MemorySourceResolver {
    sources: HashMap<String, String>,
}

impl FileResolver for MemorySourceResolver {
    fn open_file(&self, name: &str) -> std::result::Result<File, protox::Error> {
        match self.sources.get(name) {
            Some(content) => File::from_source(name, content),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}
