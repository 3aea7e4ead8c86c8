//! Compiled module cache keyed by sandbox-relative path.
//!
//! Each entry is tagged with a content fingerprint (SHA-256 over the file
//! bytes and its modification time) and a generation number. A changed
//! fingerprint replaces the slot with a new `Arc<ModuleEntry>`; callers that
//! already hold the old `Arc` keep using it until their call ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use wasmtime::{Engine, ExternType, Module, ValType};

use crate::error::{GatewayError, Result};
use crate::index::{normalize_relative, ModuleIndex};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::signature::{extract_signatures, FunctionSignature};

/// A compiled module and its declared functions.
///
/// Owned by the cache; the executor borrows it (through an `Arc`) for the
/// duration of one call.
pub struct ModuleEntry {
    path: String,
    fingerprint: String,
    generation: u64,
    module: Module,
    functions: Vec<FunctionSignature>,
    last_used: AtomicU64,
}

impl ModuleEntry {
    /// Sandbox-relative path of the module file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Hex SHA-256 content fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Generation assigned when this entry was inserted.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Declared, callable functions.
    pub fn functions(&self) -> &[FunctionSignature] {
        &self.functions
    }

    /// Look up a declared function by name.
    pub fn function(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }

    fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Counters describing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// A thread-safe, capacity-bounded cache of compiled modules.
///
/// Lookups of unchanged entries take only a shared read lock; inserts and
/// evictions take a short exclusive lock that is never held while compiling
/// or executing.
pub struct ModuleCache {
    engine: SharedEngine,
    index: ModuleIndex,
    capacity: usize,
    entries: RwLock<HashMap<String, Arc<ModuleEntry>>>,
    tick: AtomicU64,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ModuleCache {
    /// Create an empty cache holding at most `capacity` modules.
    pub fn new(engine: SharedEngine, index: ModuleIndex, capacity: usize) -> Self {
        Self {
            engine,
            index,
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
            tick: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The engine modules are compiled for.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// Resolve a sandbox-relative path to a compiled module.
    ///
    /// The file is re-fingerprinted on every call; a matching entry is
    /// returned as-is, anything else is recompiled and replaces the slot.
    pub fn resolve(&self, path: &str) -> Result<Arc<ModuleEntry>> {
        let key = cache_key(path)?;
        let (bytes, modified) = self.index.read_bytes(&key).map_err(|e| match e {
            GatewayError::PathEscape(_) => e,
            GatewayError::NotFound(_) => GatewayError::Load(format!("module '{key}' not found")),
            other => GatewayError::Load(format!("module '{key}' is unreadable: {}", other.message())),
        })?;
        let fingerprint = fingerprint(&bytes, modified);

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&key) {
                if entry.fingerprint == fingerprint {
                    entry.touch(self.next_tick());
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(module = %key, generation = entry.generation, "module cache hit");
                    return Ok(Arc::clone(entry));
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = compile(self.engine.engine(), &key, &bytes);
        let (module, functions) = match compiled {
            Ok(compiled) => compiled,
            Err(e) => {
                // The file changed into something unloadable: forget the old handle.
                if self.entries.write().remove(&key).is_some() {
                    tracing::debug!(module = %key, "dropped stale entry after failed reload");
                }
                return Err(e);
            }
        };
        self.compilations.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if existing.fingerprint == fingerprint {
                existing.touch(self.next_tick());
                return Ok(Arc::clone(existing));
            }
        }

        let entry = Arc::new(ModuleEntry {
            path: key.clone(),
            fingerprint,
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
            module,
            functions,
            last_used: AtomicU64::new(self.next_tick()),
        });
        let replaced = entries.insert(key.clone(), Arc::clone(&entry)).is_some();
        tracing::debug!(
            module = %key,
            generation = entry.generation,
            replaced,
            "module compiled"
        );

        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .filter(|(k, _)| **k != key)
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            entries.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(module = %victim, "module evicted");
        }

        Ok(entry)
    }

    /// Declared signature of `function` in the module at `path`.
    pub fn get_signature(&self, path: &str, function: &str) -> Result<FunctionSignature> {
        let entry = self.resolve(path)?;
        entry.function(function).cloned().ok_or_else(|| {
            GatewayError::FunctionNotFound(format!(
                "'{function}' is not declared by '{}'",
                entry.path()
            ))
        })
    }

    /// Check if a module is cached.
    pub fn contains(&self, path: &str) -> bool {
        match cache_key(path) {
            Ok(key) => self.entries.read().contains_key(&key),
            Err(_) => false,
        }
    }

    /// Generation of the cached entry for `path`, if any.
    pub fn generation_of(&self, path: &str) -> Option<u64> {
        let key = cache_key(path).ok()?;
        self.entries.read().get(&key).map(|e| e.generation)
    }

    /// Remove a module from the cache.
    ///
    /// Returns `true` if the module was present and removed.
    pub fn remove(&self, path: &str) -> bool {
        match cache_key(path) {
            Ok(key) => self.entries.write().remove(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Clear all cached modules.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Get the number of cached modules.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn cache_key(path: &str) -> Result<String> {
    let clean = normalize_relative(path)?;
    let key = clean.to_string_lossy().replace('\\', "/");
    if key.is_empty() {
        return Err(GatewayError::Load("empty module path".to_string()));
    }
    Ok(key)
}

fn fingerprint(bytes: &[u8], modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(nanos.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn compile(engine: &Engine, path: &str, bytes: &[u8]) -> Result<(Module, Vec<FunctionSignature>)> {
    let binary = wat::parse_bytes(bytes)
        .map_err(|e| GatewayError::Load(format!("'{path}' failed to parse: {e}")))?;
    let functions = extract_signatures(&binary).map_err(|e| match e {
        GatewayError::Load(m) => GatewayError::Load(format!("'{path}': {m}")),
        other => other,
    })?;
    let module = Module::from_binary(engine, &binary)
        .map_err(|e| GatewayError::Load(format!("'{path}' failed to compile: {e}")))?;
    verify_exports(&module, &functions, path)?;
    Ok((module, functions))
}

fn func_type_is(module: &Module, name: &str, params: &[ValType], results: &[ValType]) -> bool {
    let Some(ExternType::Func(ty)) = module.get_export(name) else {
        return false;
    };
    let same = |actual: Vec<ValType>, expected: &[ValType]| {
        actual.len() == expected.len()
            && actual.iter().zip(expected).all(|pair| {
                matches!(
                    pair,
                    (ValType::I32, ValType::I32) | (ValType::I64, ValType::I64)
                )
            })
    };
    same(ty.params().collect(), params) && same(ty.results().collect(), results)
}

/// Check every declared function against the guest calling convention.
fn verify_exports(module: &Module, functions: &[FunctionSignature], path: &str) -> Result<()> {
    if functions.is_empty() {
        return Ok(());
    }
    if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
        return Err(GatewayError::Load(format!(
            "'{path}' does not export its memory"
        )));
    }
    if !func_type_is(module, "alloc", &[ValType::I32], &[ValType::I32]) {
        return Err(GatewayError::Load(format!(
            "'{path}' must export alloc(i32) -> i32"
        )));
    }
    for function in functions {
        if !func_type_is(module, &function.name, &[ValType::I32, ValType::I32], &[ValType::I64]) {
            return Err(GatewayError::Load(format!(
                "'{path}' declares '{}' but does not export it as (i32, i32) -> i64",
                function.name
            )));
        }
    }
    Ok(())
}

/// A shared engine that can be reused across sandbox instances.
///
/// Wraps an `Arc<Engine>` for thread-safe sharing.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for SharedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedEngine")
            .field("engine", &"<wasmtime::Engine>")
            .finish()
    }
}

impl SharedEngine {
    /// Create an engine configured for the given sandbox ceilings.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let engine_config = Self::engine_config(config);
        Self::from_config(&engine_config)
    }

    /// Create a new shared engine from an existing engine configuration.
    pub fn from_config(config: &wasmtime::Config) -> Result<Self> {
        let engine = Engine::new(config)
            .map_err(|e| GatewayError::Config(format!("failed to create engine: {e}")))?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Get a reference to the underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the Arc<Engine> for sharing.
    pub fn arc(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    fn engine_config(config: &SandboxConfig) -> wasmtime::Config {
        let mut engine_config = wasmtime::Config::new();
        engine_config.epoch_interruption(true);
        engine_config.consume_fuel(config.max_fuel.is_some());
        engine_config.max_wasm_stack(config.max_stack);
        engine_config.wasm_backtrace(true);
        engine_config
    }
}

impl std::ops::Deref for SharedEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}
