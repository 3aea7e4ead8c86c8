//! Resource limiting for the Wasm sandbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wasmtime::{ResourceLimiter, Store, UpdateDeadline};

use crate::sandbox::host::{HostState, HostTrap};

/// Table elements a module may allocate.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Which ceiling a guest ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ceiling {
    Memory,
    Table,
}

/// Growth accounting for one store.
///
/// A denied growth is not a trap by itself: `memory.grow` returns -1 to the
/// guest. The denial is remembered so the failure that usually follows is
/// reported as `ResourceExceeded` instead of a generic trap.
#[derive(Debug)]
pub struct SandboxLimiter {
    max_memory: u64,
    current_memory: u64,
    peak_memory: u64,
    hit: Option<Ceiling>,
}

impl SandboxLimiter {
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            peak_memory: 0,
            hit: None,
        }
    }

    /// The first ceiling the guest ran into, if any.
    pub fn ceiling_hit(&self) -> Option<Ceiling> {
        self.hit
    }

    pub fn limit_exceeded(&self) -> bool {
        self.hit.is_some()
    }

    pub fn current_memory(&self) -> u64 {
        self.current_memory
    }

    /// Highest linear memory size seen during the call.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    /// Describe the ceiling that was hit.
    pub fn describe(&self) -> String {
        match self.hit {
            Some(Ceiling::Table) => {
                format!("table limit of {MAX_TABLE_ELEMENTS} elements exceeded")
            }
            _ => format!("memory limit of {} bytes exceeded", self.max_memory),
        }
    }

    fn deny(&mut self, ceiling: Ceiling) -> anyhow::Result<bool> {
        self.hit.get_or_insert(ceiling);
        tracing::debug!(?ceiling, "guest growth denied");
        Ok(false)
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired = desired as u64;
        if desired > self.max_memory {
            return self.deny(Ceiling::Memory);
        }
        self.current_memory = desired;
        self.peak_memory = self.peak_memory.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > MAX_TABLE_ELEMENTS {
            return self.deny(Ceiling::Table);
        }
        Ok(true)
    }
}

/// Cancellation flag shared between a running call and its owner.
///
/// Raising it makes the next epoch check trap the guest, whether or not the
/// guest cooperates.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Create a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock budget of one call, checked on every epoch tick.
#[derive(Debug, Clone)]
pub struct CallDeadline {
    started: Instant,
    timeout: Duration,
    abort: AbortSignal,
}

impl CallDeadline {
    /// Start the clock now.
    pub fn start(timeout: Duration, abort: AbortSignal) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            abort,
        }
    }

    /// Decide whether the guest may keep running.
    pub fn check(&self) -> Result<(), HostTrap> {
        if self.abort.is_aborted() {
            return Err(HostTrap::Cancelled);
        }
        if self.started.elapsed() >= self.timeout {
            return Err(HostTrap::Timeout);
        }
        Ok(())
    }
}

/// Store data that includes the resource limiter and execution context.
///
/// A fresh instance is built for every call and dropped with its store.
pub struct StoreData {
    /// The resource limiter.
    pub limiter: SandboxLimiter,
    /// WASI Preview 1 context for the sandbox.
    pub wasi: wasmtime_wasi::preview1::WasiP1Ctx,
    /// Gateway host capabilities (scratch filesystem, raise, log).
    pub host: HostState,
    /// Wall-clock budget and abort signal.
    pub deadline: CallDeadline,
}

impl StoreData {
    /// Create new store data for one call.
    pub fn new(
        max_memory: u64,
        wasi: wasmtime_wasi::preview1::WasiP1Ctx,
        host: HostState,
        deadline: CallDeadline,
    ) -> Self {
        Self {
            limiter: SandboxLimiter::new(max_memory),
            wasi,
            host,
            deadline,
        }
    }
}

/// Installs the per-call guards on a store.
pub trait StoreGuards {
    /// Route growth through [`SandboxLimiter`] and check [`CallDeadline`]
    /// on every epoch tick.
    fn install_guards(&mut self);
}

impl StoreGuards for Store<StoreData> {
    fn install_guards(&mut self) {
        self.limiter(|data| &mut data.limiter);
        self.set_epoch_deadline(1);
        self.epoch_deadline_callback(|ctx| {
            ctx.data().deadline.check()?;
            Ok(UpdateDeadline::Continue(1))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_within_ceiling() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);
        assert!(limiter.memory_growing(0, 512 * 1024, None).unwrap());
        assert_eq!(limiter.ceiling_hit(), None);
        assert_eq!(limiter.peak_memory(), 512 * 1024);
    }

    #[test]
    fn test_denied_growth_is_remembered() {
        let mut limiter = SandboxLimiter::new(1024 * 1024);
        assert!(!limiter.memory_growing(0, 2 * 1024 * 1024, None).unwrap());
        assert_eq!(limiter.ceiling_hit(), Some(Ceiling::Memory));
        assert_eq!(limiter.describe(), "memory limit of 1048576 bytes exceeded");

        // Later denials do not overwrite the first.
        assert!(!limiter.table_growing(0, 1_000_000, None).unwrap());
        assert_eq!(limiter.ceiling_hit(), Some(Ceiling::Memory));
    }

    #[test]
    fn test_table_ceiling() {
        let mut limiter = SandboxLimiter::new(1024);
        assert!(limiter.table_growing(0, 100, None).unwrap());
        assert!(!limiter.table_growing(100, 20_000, None).unwrap());
        assert!(limiter.describe().starts_with("table limit"));
    }

    #[test]
    fn test_peak_survives_shrink() {
        let mut limiter = SandboxLimiter::new(4 * 1024 * 1024);
        limiter.memory_growing(0, 3 * 1024 * 1024, None).unwrap();
        limiter.memory_growing(0, 1024 * 1024, None).unwrap();
        assert_eq!(limiter.current_memory(), 1024 * 1024);
        assert_eq!(limiter.peak_memory(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = CallDeadline::start(Duration::ZERO, AbortSignal::new());
        assert!(matches!(deadline.check(), Err(HostTrap::Timeout)));

        let deadline = CallDeadline::start(Duration::from_secs(60), AbortSignal::new());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn test_abort_wins_over_timeout() {
        let signal = AbortSignal::new();
        let deadline = CallDeadline::start(Duration::ZERO, signal.clone());
        signal.abort();
        assert!(matches!(deadline.check(), Err(HostTrap::Cancelled)));
    }
}
