//! Core execution engine: validate a call, invoke it inside a store, and
//! turn whatever happened into an [`ExecutionResult`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use wasmtime::{Linker, Store, Trap, WasmBacktrace};
use wasmtime_wasi::I32Exit;

use crate::error::{ErrorKind, GatewayError, Result};
use crate::sandbox::cache::ModuleEntry;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::host::{vet_imports, HostTrap};
use crate::sandbox::limits::StoreData;

/// Structured failure of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Exception type raised by the function, for `ExecutionError`.
    pub exception_type: Option<String>,
    pub traceback: Option<String>,
}

impl From<&GatewayError> for ExecutionFailure {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::Execution {
                exception_type,
                message,
                traceback,
            } => Self {
                kind: ErrorKind::ExecutionError,
                message: message.clone(),
                exception_type: Some(exception_type.clone()),
                traceback: traceback.clone(),
            },
            other => Self {
                kind: other.kind(),
                message: other.message(),
                exception_type: None,
                traceback: None,
            },
        }
    }
}

/// Either the returned value or the failure; never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(ExecutionFailure),
}

/// Result of one sandboxed call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Wall-clock time, measured regardless of outcome.
    pub elapsed_ms: u64,
    /// Peak linear memory observed, if the call got far enough to allocate.
    pub peak_memory_bytes: Option<u64>,
    /// Captured guest stdout.
    pub stdout: String,
    /// Captured guest stderr.
    pub stderr: String,
}

impl ExecutionResult {
    /// A failed result with no captured output.
    pub fn failed(err: &GatewayError, elapsed: Duration) -> Self {
        Self {
            outcome: Outcome::Failure(err.into()),
            elapsed_ms: elapsed.as_millis() as u64,
            peak_memory_bytes: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Check if the call returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// The returned value, if any.
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Success(v) => Some(v),
            Outcome::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match &self.outcome {
            Outcome::Success(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }
}

/// Size ceilings applied to everything that crosses the guest boundary.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryLimits {
    pub max_string_bytes: usize,
    pub max_collection_len: usize,
}

impl BoundaryLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_string_bytes: config.max_string_bytes,
            max_collection_len: config.max_collection_len,
        }
    }

    /// Walk `value` and reject oversized strings and collections.
    pub fn check(&self, value: &Value, what: &str) -> Result<()> {
        match value {
            Value::String(s) if s.len() > self.max_string_bytes => {
                Err(GatewayError::ResourceExceeded(format!(
                    "{what} contains a string of {} bytes (limit {})",
                    s.len(),
                    self.max_string_bytes
                )))
            }
            Value::Array(items) => {
                if items.len() > self.max_collection_len {
                    return Err(self.collection_error(what, items.len()));
                }
                items.iter().try_for_each(|v| self.check(v, what))
            }
            Value::Object(map) => {
                if map.len() > self.max_collection_len {
                    return Err(self.collection_error(what, map.len()));
                }
                map.values().try_for_each(|v| self.check(v, what))
            }
            _ => Ok(()),
        }
    }

    fn check_buffer(&self, len: usize, what: &str) -> Result<()> {
        if len > self.max_string_bytes {
            return Err(GatewayError::ResourceExceeded(format!(
                "{what} is {len} bytes (limit {})",
                self.max_string_bytes
            )));
        }
        Ok(())
    }

    fn collection_error(&self, what: &str, len: usize) -> GatewayError {
        GatewayError::ResourceExceeded(format!(
            "{what} contains a collection of {len} entries (limit {})",
            self.max_collection_len
        ))
    }
}

/// A validated call, ready to run inside the sandbox.
///
/// Holds a borrowed module handle; dropping the call releases it.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    entry: Arc<ModuleEntry>,
    function: String,
    input: Vec<u8>,
}

impl PreparedCall {
    pub fn entry(&self) -> &ModuleEntry {
        &self.entry
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// `path::function`, used in logs and tracebacks.
    pub fn label(&self) -> String {
        format!("{}::{}", self.entry.path(), self.function)
    }
}

/// Validates and invokes declared functions.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    limits: BoundaryLimits,
}

impl Executor {
    pub fn new(limits: BoundaryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> BoundaryLimits {
        self.limits
    }

    /// Look up and validate a call without side effects.
    ///
    /// Fails with `FunctionNotFound` for undeclared functions and
    /// `ValidationError` for parameters that do not match the signature.
    pub fn prepare(
        &self,
        entry: Arc<ModuleEntry>,
        function: &str,
        params: &Map<String, Value>,
    ) -> Result<PreparedCall> {
        let signature = entry.function(function).ok_or_else(|| {
            GatewayError::FunctionNotFound(format!(
                "'{function}' is not declared by '{}'",
                entry.path()
            ))
        })?;
        crate::sandbox::signature::validate_params(
            &format!("'{}::{function}'", entry.path()),
            &signature.params,
            params,
        )?;

        let input = serde_json::to_vec(params)
            .map_err(|e| GatewayError::Validation(format!("parameters are not serializable: {e}")))?;
        self.limits.check_buffer(input.len(), "parameters")?;
        for value in params.values() {
            self.limits.check(value, "parameters")?;
        }

        Ok(PreparedCall {
            entry,
            function: function.to_string(),
            input,
        })
    }

    /// Run a prepared call in `store`. Called inside the sandbox boundary.
    pub fn invoke(
        &self,
        call: &PreparedCall,
        store: &mut Store<StoreData>,
        linker: &Linker<StoreData>,
        timeout: Duration,
    ) -> Result<Value> {
        let module = call.entry.module();
        vet_imports(module)?;

        let instance = linker.instantiate(&mut *store, module).map_err(|e| {
            if is_trap(&e) || store.data().limiter.limit_exceeded() {
                classify_trap(e, store, call, timeout)
            } else {
                GatewayError::Load(format!("'{}' failed to instantiate: {e}", call.entry.path()))
            }
        })?;

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| abi_error("module does not export memory"))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, "alloc")
            .map_err(|_| abi_error("module does not export alloc(i32) -> i32"))?;
        let func = instance
            .get_typed_func::<(i32, i32), i64>(&mut *store, &call.function)
            .map_err(|_| abi_error("function has the wrong type"))?;

        let input_len = i32::try_from(call.input.len())
            .map_err(|_| GatewayError::ResourceExceeded("parameters too large".to_string()))?;
        let input_ptr = alloc
            .call(&mut *store, input_len)
            .map_err(|e| classify_trap(e, store, call, timeout))?;
        memory
            .write(&mut *store, input_ptr as u32 as usize, &call.input)
            .map_err(|_| abi_error("alloc returned an out-of-bounds buffer"))?;

        let packed = func
            .call(&mut *store, (input_ptr, input_len))
            .map_err(|e| classify_trap(e, store, call, timeout))?;
        if store.data().limiter.limit_exceeded() {
            return Err(ceiling_exceeded(store));
        }

        let out_ptr = ((packed as u64) >> 32) as usize;
        let out_len = ((packed as u64) & 0xffff_ffff) as usize;
        self.limits.check_buffer(out_len, "result")?;

        let mut output = vec![0u8; out_len];
        memory
            .read(&*store, out_ptr, &mut output)
            .map_err(|_| abi_error("result buffer is out of bounds"))?;
        let value: Value = serde_json::from_slice(&output)
            .map_err(|e| abi_error(&format!("result is not valid JSON: {e}")))?;
        self.limits.check(&value, "result")?;
        Ok(value)
    }
}

fn abi_error(message: &str) -> GatewayError {
    GatewayError::Execution {
        exception_type: "AbiError".to_string(),
        message: message.to_string(),
        traceback: None,
    }
}

fn ceiling_exceeded(store: &Store<StoreData>) -> GatewayError {
    GatewayError::ResourceExceeded(store.data().limiter.describe())
}

fn is_trap(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Trap>().is_some() || err.downcast_ref::<HostTrap>().is_some()
}

/// Map a trap raised during a call to the gateway taxonomy.
fn classify_trap(
    err: anyhow::Error,
    store: &Store<StoreData>,
    call: &PreparedCall,
    timeout: Duration,
) -> GatewayError {
    if store.data().limiter.limit_exceeded() {
        return ceiling_exceeded(store);
    }
    let backtrace = err.downcast_ref::<WasmBacktrace>().map(|bt| bt.to_string());

    if let Some(host) = err.downcast_ref::<HostTrap>() {
        return match host {
            HostTrap::Raised {
                exception_type,
                message,
            } => GatewayError::Execution {
                exception_type: exception_type.clone(),
                message: message.clone(),
                traceback: Some(format_traceback(
                    call,
                    backtrace.as_deref(),
                    exception_type,
                    message,
                )),
            },
            HostTrap::PermissionDenied(m) => GatewayError::PermissionDenied(m.clone()),
            HostTrap::ResourceExceeded(m) => GatewayError::ResourceExceeded(m.clone()),
            HostTrap::Abi(m) => GatewayError::Execution {
                exception_type: "AbiError".to_string(),
                message: m.clone(),
                traceback: Some(format_traceback(call, backtrace.as_deref(), "AbiError", m)),
            },
            HostTrap::Timeout | HostTrap::Cancelled => GatewayError::Timeout(timeout),
        };
    }

    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::OutOfFuel => GatewayError::ResourceExceeded("fuel exhausted".to_string()),
            Trap::StackOverflow => GatewayError::ResourceExceeded("stack exhausted".to_string()),
            Trap::Interrupt => GatewayError::Timeout(timeout),
            other => {
                let message = other.to_string();
                GatewayError::Execution {
                    traceback: Some(format_traceback(call, backtrace.as_deref(), "Trap", &message)),
                    exception_type: "Trap".to_string(),
                    message,
                }
            }
        };
    }

    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        let message = format!("module exited with status {}", exit.0);
        return GatewayError::Execution {
            traceback: Some(format_traceback(call, backtrace.as_deref(), "SystemExit", &message)),
            exception_type: "SystemExit".to_string(),
            message,
        };
    }

    let message = err.root_cause().to_string();
    GatewayError::Execution {
        traceback: Some(format_traceback(call, backtrace.as_deref(), "RuntimeError", &message)),
        exception_type: "RuntimeError".to_string(),
        message,
    }
}

fn format_traceback(
    call: &PreparedCall,
    backtrace: Option<&str>,
    exception_type: &str,
    message: &str,
) -> String {
    let mut out = String::from("Traceback (most recent call last):\n");
    out.push_str(&format!("  in {}\n", call.label()));
    if let Some(bt) = backtrace {
        for line in bt.lines().map(str::trim).filter(|l| !l.is_empty()) {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push_str(exception_type);
    if !message.is_empty() {
        out.push_str(": ");
        out.push_str(message);
    }
    out
}
