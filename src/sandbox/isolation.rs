//! Per-call isolation: a fresh store, WASI context, scratch directory and
//! deadline for every execution, plus the watchdog that can stop any of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use wasmtime::{Engine, Linker, Store};
use wasmtime_wasi::preview1;
use wasmtime_wasi::WasiCtxBuilder;

use crate::error::{ErrorKind, GatewayError, Result};
use crate::sandbox::cache::{ModuleEntry, SharedEngine};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::executor::{
    BoundaryLimits, ExecutionFailure, ExecutionResult, Executor, Outcome, PreparedCall,
};
use crate::sandbox::host::{self, HostState};
use crate::sandbox::io::SandboxIo;
use crate::sandbox::limits::{AbortSignal, CallDeadline, StoreData, StoreGuards};

/// Environment variable carrying the gateway session id into every call.
pub const SESSION_ENV: &str = "GATEWAY_SESSION_ID";

/// Per-execution lifecycle.
///
/// `Submitted → Validating → (Rejected | Running) →
/// (Completed | Failed | TimedOut | ResourceExceeded)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Submitted,
    Validating,
    Rejected,
    Running,
    Completed,
    Failed,
    TimedOut,
    ResourceExceeded,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Submitted => "submitted",
            ExecutionState::Validating => "validating",
            ExecutionState::Rejected => "rejected",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed-out",
            ExecutionState::ResourceExceeded => "resource-exceeded",
        }
    }

    /// Terminal states admit no further transition. Retrying is a new
    /// execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Rejected
                | ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::ResourceExceeded
        )
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Submitted, Validating)
                | (Validating, Rejected)
                | (Validating, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, ResourceExceeded)
        )
    }

    /// Terminal state reached by a call that started running.
    pub fn after_run(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success(_) => ExecutionState::Completed,
            Outcome::Failure(f) => match f.kind {
                ErrorKind::TimeoutError => ExecutionState::TimedOut,
                ErrorKind::ResourceExceeded => ExecutionState::ResourceExceeded,
                _ => ExecutionState::Failed,
            },
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one execution through its states, tracing every transition.
#[derive(Debug)]
pub struct Lifecycle {
    execution_id: String,
    state: ExecutionState,
}

impl Lifecycle {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            state: ExecutionState::Submitted,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Move to `next`. Returns `false` and stays put on an illegal
    /// transition.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                execution_id = %self.execution_id,
                from = %self.state,
                to = %next,
                "illegal lifecycle transition ignored"
            );
            return false;
        }
        tracing::debug!(
            execution_id = %self.execution_id,
            from = %self.state,
            to = %next,
            "lifecycle transition"
        );
        self.state = next;
        true
    }
}

/// Background thread advancing the engine epoch once per tick.
///
/// Stores check their call deadline on each tick, so this thread is what
/// stops a guest that never yields.
struct EpochWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochWatchdog {
    fn spawn(engine: Engine, tick: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("gateway-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochWatchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Raises the abort signal when the owning future is dropped.
struct AbortOnDrop(AbortSignal);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything a blocking execution needs, owned so it can move to another
/// thread.
struct CallContext {
    engine: Engine,
    linker: Arc<Linker<StoreData>>,
    config: SandboxConfig,
    executor: Executor,
    module_root: PathBuf,
    scratch_root: PathBuf,
    session_id: String,
    abort: AbortSignal,
}

impl CallContext {
    fn execute(self, call: PreparedCall) -> ExecutionResult {
        let started = Instant::now();
        let label = call.label();

        let scratch = match tempfile::Builder::new()
            .prefix("gateway-scratch-")
            .tempdir_in(&self.scratch_root)
        {
            Ok(dir) => dir,
            Err(e) => return ExecutionResult::failed(&GatewayError::Io(e), started.elapsed()),
        };
        let scratch_path = match std::fs::canonicalize(scratch.path()) {
            Ok(path) => path,
            Err(e) => return ExecutionResult::failed(&GatewayError::Io(e), started.elapsed()),
        };

        let io = SandboxIo::new(self.config.max_output_bytes);
        let mut wasi = WasiCtxBuilder::new();
        wasi.stdout(io.stdout.clone())
            .stderr(io.stderr.clone())
            .args(&[label.as_str()])
            .env(SESSION_ENV, &self.session_id);
        for name in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(name) {
                wasi.env(name, value);
            }
        }

        let host = HostState::new(
            self.module_root.clone(),
            Some(scratch_path),
            self.config.max_open_files,
            self.config.max_string_bytes,
            label.clone(),
        );
        let deadline = CallDeadline::start(self.config.timeout, self.abort.clone());
        let data = StoreData::new(self.config.max_memory, wasi.build_p1(), host, deadline);

        let mut store = Store::new(&self.engine, data);
        store.install_guards();
        if let Some(fuel) = self.config.max_fuel {
            if let Err(e) = store.set_fuel(fuel) {
                let err = GatewayError::Config(format!("failed to set fuel: {e}"));
                return ExecutionResult::failed(&err, started.elapsed());
            }
        }

        let result = self
            .executor
            .invoke(&call, &mut store, &self.linker, self.config.timeout);
        let peak = store.data().limiter.peak_memory();
        drop(store);
        drop(scratch);

        let stdout = io.stdout_str();
        let stderr = io.stderr_str();
        let outcome = match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => {
                let mut failure = ExecutionFailure::from(&err);
                if failure.kind == ErrorKind::ExecutionError && !stderr.is_empty() {
                    let tb = failure.traceback.get_or_insert_with(String::new);
                    tb.push_str("\n--- guest stderr ---\n");
                    tb.push_str(stderr.trim_end());
                }
                Outcome::Failure(failure)
            }
        };

        ExecutionResult {
            outcome,
            elapsed_ms: started.elapsed().as_millis() as u64,
            peak_memory_bytes: (peak > 0).then_some(peak),
            stdout,
            stderr,
        }
    }
}

/// The isolation boundary around the execution engine.
///
/// Shares one engine, one linker and one watchdog across calls; nothing
/// else survives from one call to the next.
pub struct Sandbox {
    config: SandboxConfig,
    engine: SharedEngine,
    linker: Arc<Linker<StoreData>>,
    module_root: PathBuf,
    scratch_root: PathBuf,
    executor: Executor,
    session_id: String,
    _watchdog: EpochWatchdog,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .field("module_root", &self.module_root)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox for modules under `module_root`.
    ///
    /// `engine` must have been created from the same `config` (epoch
    /// interruption, fuel and stack settings live on the engine).
    pub fn new(config: SandboxConfig, engine: SharedEngine, module_root: &Path) -> Result<Self> {
        let module_root = std::fs::canonicalize(module_root)
            .map_err(|e| GatewayError::Config(format!("module root is unusable: {e}")))?;
        std::fs::create_dir_all(&config.scratch_root)?;
        let scratch_root = std::fs::canonicalize(&config.scratch_root)?;

        let mut linker = Linker::new(engine.engine());
        preview1::add_to_linker_sync(&mut linker, |data: &mut StoreData| &mut data.wasi)
            .map_err(|e| GatewayError::Config(format!("failed to link WASI: {e}")))?;
        host::add_to_linker(&mut linker)
            .map_err(|e| GatewayError::Config(format!("failed to link host functions: {e}")))?;

        let watchdog = EpochWatchdog::spawn(engine.engine().clone(), config.epoch_tick_interval)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(session_id = %session_id, "sandbox ready");

        Ok(Self {
            executor: Executor::new(BoundaryLimits::from_config(&config)),
            config,
            engine,
            linker: Arc::new(linker),
            module_root,
            scratch_root,
            session_id,
            _watchdog: watchdog,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Identifier exposed to guests as `GATEWAY_SESSION_ID`.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Validate and run `function` from `entry` with `params`.
    ///
    /// Validation failures are returned as `Err` and nothing runs.
    pub async fn execute(
        &self,
        entry: Arc<ModuleEntry>,
        function: &str,
        params: &Map<String, Value>,
    ) -> Result<ExecutionResult> {
        let call = self.executor.prepare(entry, function, params)?;
        Ok(self.run(call).await)
    }

    /// Run a prepared call to completion, timeout or cancellation.
    ///
    /// Dropping the returned future aborts the guest on the next epoch tick.
    pub async fn run(&self, call: PreparedCall) -> ExecutionResult {
        let started = Instant::now();
        let abort = AbortSignal::new();
        let _guard = AbortOnDrop(abort.clone());
        let label = call.label();

        let context = CallContext {
            engine: self.engine.engine().clone(),
            linker: Arc::clone(&self.linker),
            config: self.config.clone(),
            executor: self.executor,
            module_root: self.module_root.clone(),
            scratch_root: self.scratch_root.clone(),
            session_id: self.session_id.clone(),
            abort: abort.clone(),
        };
        let task = tokio::task::spawn_blocking(move || context.execute(call));

        let limit = self.config.timeout + self.config.grace;
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => {
                tracing::error!(call = %label, error = %join, "execution task failed");
                let err = GatewayError::Execution {
                    exception_type: "RuntimeError".to_string(),
                    message: "execution task failed".to_string(),
                    traceback: None,
                };
                ExecutionResult::failed(&err, started.elapsed())
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(call = %label, ?limit, "watchdog grace period elapsed");
                ExecutionResult::failed(&GatewayError::Timeout(self.config.timeout), started.elapsed())
            }
        }
    }
}
