//! Sandboxed module loader.
//!
//! [`ModuleLoader`] owns the shared wasmtime [`Engine`] and compiles `.wasm`
//! language-server binaries into [`Module`]s.  Modules are registered by name
//! in insertion order; a missing or unparsable module is a fatal startup
//! error surfaced to the caller.

use std::path::Path;

use wasmtime::{Engine, Module};

use crate::error::{Result, SandboxError};

/// A compiled module together with its registry name.
struct LoadedModule {
    name: String,
    module: Module,
}

/// Loads and registers sandboxed-execution modules.
///
/// The loader owns the engine every module is compiled against; the same
/// engine must be handed to the [`Supervisor`](crate::process::Supervisor)
/// that instantiates them.  Lookup by name is O(n), which is acceptable for
/// the expected number of loaded modules (a handful, not thousands).
pub struct ModuleLoader {
    engine: Engine,
    modules: Vec<LoadedModule>,
}

impl ModuleLoader {
    /// Create a loader with an engine tuned for hosting server processes.
    ///
    /// The engine runs guests on the async executor with epoch interruption,
    /// so a running guest yields back to the host scheduler between epochs
    /// instead of monopolizing a thread.  Threaded guests importing a shared
    /// linear memory are supported.
    pub fn new() -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        config.epoch_interruption(true);
        config.wasm_threads(true);

        let engine = Engine::new(&config)
            .map_err(|e| SandboxError::Creation(format!("failed to create wasm engine: {e}")))?;

        tracing::info!("module loader initialized");

        Ok(Self {
            engine,
            modules: Vec::new(),
        })
    }

    /// Return a reference to the shared wasmtime [`Engine`].
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Read a `.wasm` file from disk and compile it under `name`.
    ///
    /// The file is read asynchronously; compilation is CPU-bound and runs on
    /// a blocking thread so it does not stall the host event loop.
    pub async fn load_file(&mut self, name: &str, path: &Path) -> Result<Module> {
        self.reject_duplicate(name)?;

        let bytes = tokio::fs::read(path).await.map_err(SandboxError::Io)?;

        tracing::debug!(
            module = name,
            path = %path.display(),
            size_bytes = bytes.len(),
            "read module bytes from disk"
        );

        let engine = self.engine.clone();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| SandboxError::Compilation(format!("blocking task panicked: {e}")))?
            .map_err(|e| SandboxError::Compilation(e.to_string()))?;

        tracing::info!(module = name, path = %path.display(), "compiled sandboxed module");
        self.register(name, module.clone());
        Ok(module)
    }

    /// Compile a module from raw bytes already in memory.
    ///
    /// Used for embedded modules and tests; accepts the textual wasm format
    /// as well, since the engine is built with `wat` support.
    pub fn load_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<Module> {
        self.reject_duplicate(name)?;

        let module = Module::new(&self.engine, bytes)
            .map_err(|e| SandboxError::Compilation(e.to_string()))?;

        tracing::info!(module = name, "compiled sandboxed module from bytes");
        self.register(name, module.clone());
        Ok(module)
    }

    /// Look up a compiled module by name.
    pub fn get(&self, name: &str) -> Option<Module> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.module.clone())
    }

    /// Names of all registered modules, in load order.
    pub fn list(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    fn reject_duplicate(&self, name: &str) -> Result<()> {
        if self.modules.iter().any(|m| m.name == name) {
            return Err(SandboxError::Compilation(format!(
                "module '{name}' is already loaded"
            )));
        }
        Ok(())
    }

    fn register(&mut self, name: &str, module: Module) {
        self.modules.push(LoadedModule {
            name: name.to_owned(),
            module,
        });
    }
}
