//! I/O capture for guest stdout/stderr.

use wasmtime_wasi::pipe::MemoryOutputPipe;

/// Captured output of one call.
///
/// Each pipe has a fixed capacity; writes past it fail inside the guest
/// instead of growing host memory.
#[derive(Clone)]
pub struct SandboxIo {
    /// Captured stdout.
    pub stdout: MemoryOutputPipe,
    /// Captured stderr.
    pub stderr: MemoryOutputPipe,
}

impl SandboxIo {
    /// Create capture pipes of `capacity` bytes each.
    pub fn new(capacity: usize) -> Self {
        Self {
            stdout: MemoryOutputPipe::new(capacity),
            stderr: MemoryOutputPipe::new(capacity),
        }
    }

    /// Get the captured stdout as a string.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout.contents()).into_owned()
    }

    /// Get the captured stderr as a string.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr.contents()).into_owned()
    }
}

impl std::fmt::Debug for SandboxIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxIo")
            .field("stdout_len", &self.stdout.contents().len())
            .field("stderr_len", &self.stderr.contents().len())
            .finish()
    }
}
