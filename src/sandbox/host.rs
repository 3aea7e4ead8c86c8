//! Host capabilities exposed to guest modules.
//!
//! The `gateway` import module is the only door out of the sandbox besides a
//! short allow-list of WASI calls. File access goes through `fs_*` imports
//! that map `/modules/...` read-only onto the module root and `/scratch/...`
//! read-write onto the per-call scratch directory. Everything else is
//! refused.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use wasmtime::{Caller, Linker, Memory, Module};

use crate::error::{GatewayError, Result};
use crate::index::confine;
use crate::sandbox::limits::StoreData;

/// Import module name for gateway host functions.
pub const GATEWAY_MODULE: &str = "gateway";

/// Host functions provided under [`GATEWAY_MODULE`].
pub const GATEWAY_IMPORTS: &[&str] = &["raise", "log", "fs_open", "fs_read", "fs_write", "fs_close"];

/// WASI preview 1 functions a module may import. No directories are
/// preopened, so none of these reach the host filesystem.
pub const WASI_ALLOWLIST: &[&str] = &[
    "args_get",
    "args_sizes_get",
    "environ_get",
    "environ_sizes_get",
    "clock_res_get",
    "clock_time_get",
    "random_get",
    "fd_write",
    "fd_close",
    "fd_fdstat_get",
    "fd_seek",
    "proc_exit",
    "sched_yield",
];

const WASI_MODULE: &str = "wasi_snapshot_preview1";
const MODULES_MOUNT: &str = "/modules/";
const SCRATCH_MOUNT: &str = "/scratch/";

/// Reasons a host function or the watchdog stops the guest.
#[derive(Debug, thiserror::Error)]
pub enum HostTrap {
    /// The guest raised an exception through `gateway.raise`.
    #[error("{exception_type}: {message}")]
    Raised {
        exception_type: String,
        message: String,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    /// The guest broke the calling convention.
    #[error("invalid guest call: {0}")]
    Abi(String),

    #[error("execution timed out")]
    Timeout,

    #[error("execution cancelled")]
    Cancelled,
}

/// Reject a module whose imports reach beyond the allow-list.
///
/// Runs before instantiation, so a module asking for sockets, process
/// spawning, dynamic loading or any unknown host function never starts.
pub fn vet_imports(module: &Module) -> Result<()> {
    for import in module.imports() {
        let allowed = match import.module() {
            GATEWAY_MODULE => GATEWAY_IMPORTS.contains(&import.name()),
            WASI_MODULE => WASI_ALLOWLIST.contains(&import.name()),
            _ => false,
        };
        if !allowed {
            return Err(GatewayError::PermissionDenied(format!(
                "import '{}.{}' is not permitted",
                import.module(),
                import.name()
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    writable: bool,
}

/// Per-call host state: open file handles and the two mounts.
#[derive(Debug)]
pub struct HostState {
    module_root: PathBuf,
    scratch: Option<PathBuf>,
    handles: HashMap<i32, OpenFile>,
    next_handle: i32,
    max_open_files: usize,
    max_buffer: usize,
    label: String,
}

impl HostState {
    /// Create host state for one call.
    ///
    /// `module_root` and `scratch` must be canonical directories; `label`
    /// identifies the call in guest log lines.
    pub fn new(
        module_root: PathBuf,
        scratch: Option<PathBuf>,
        max_open_files: usize,
        max_buffer: usize,
        label: impl Into<String>,
    ) -> Self {
        Self {
            module_root,
            scratch,
            handles: HashMap::new(),
            next_handle: 3,
            max_open_files,
            max_buffer,
            label: label.into(),
        }
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn mount<'a>(&self, guest_path: &'a str) -> std::result::Result<(&Path, &'a str, bool), HostTrap> {
        if let Some(rest) = guest_path.strip_prefix(MODULES_MOUNT) {
            return Ok((&self.module_root, rest, false));
        }
        if let Some(rest) = guest_path.strip_prefix(SCRATCH_MOUNT) {
            if let Some(scratch) = &self.scratch {
                return Ok((scratch, rest, true));
            }
        }
        Err(HostTrap::PermissionDenied(format!(
            "path '{guest_path}' is outside the sandbox"
        )))
    }

    /// Open a guest path. Returns the handle, or `-1` if the file is missing.
    pub fn open(&mut self, guest_path: &str, mode: i32) -> std::result::Result<i32, HostTrap> {
        if !(0..=2).contains(&mode) {
            return Err(HostTrap::Abi(format!("unknown open mode {mode}")));
        }
        if self.handles.len() >= self.max_open_files {
            return Err(HostTrap::ResourceExceeded(format!(
                "more than {} open file handles",
                self.max_open_files
            )));
        }

        let (root, relative, writable_mount) = self.mount(guest_path)?;
        let writing = mode != 0;
        if writing && !writable_mount {
            return Err(HostTrap::PermissionDenied(format!(
                "path '{guest_path}' is read-only"
            )));
        }

        let host_path = match confine(root, relative, !writing) {
            Ok(path) => path,
            Err(GatewayError::PathEscape(_)) => {
                return Err(HostTrap::PermissionDenied(format!(
                    "path '{guest_path}' escapes its mount"
                )))
            }
            Err(_) => return Ok(-1),
        };

        let opened = match mode {
            0 => File::open(&host_path),
            1 => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&host_path),
            _ => OpenOptions::new().append(true).create(true).open(&host_path),
        };
        let Ok(file) = opened else {
            return Ok(-1);
        };

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            handle,
            OpenFile {
                file,
                writable: writing,
            },
        );
        Ok(handle)
    }

    /// Read up to `len` bytes. `None` for an unknown handle.
    pub fn read(&mut self, handle: i32, len: usize) -> std::result::Result<Option<Vec<u8>>, HostTrap> {
        self.check_buffer(len)?;
        let Some(open) = self.handles.get_mut(&handle) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        let n = open.file.read(&mut buf).unwrap_or(0);
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Write all of `bytes`. Returns the count, or `-1` for an unknown handle.
    pub fn write(&mut self, handle: i32, bytes: &[u8]) -> std::result::Result<i32, HostTrap> {
        self.check_buffer(bytes.len())?;
        let Some(open) = self.handles.get_mut(&handle) else {
            return Ok(-1);
        };
        if !open.writable {
            return Err(HostTrap::PermissionDenied(
                "handle was opened read-only".to_string(),
            ));
        }
        match open.file.write_all(bytes) {
            Ok(()) => Ok(bytes.len() as i32),
            Err(_) => Ok(-1),
        }
    }

    /// Close a handle. `0` on success, `-1` for an unknown handle.
    pub fn close(&mut self, handle: i32) -> i32 {
        if self.handles.remove(&handle).is_some() {
            0
        } else {
            -1
        }
    }

    fn check_buffer(&self, len: usize) -> std::result::Result<(), HostTrap> {
        if len > self.max_buffer {
            return Err(HostTrap::ResourceExceeded(format!(
                "buffer of {len} bytes exceeds {} byte limit",
                self.max_buffer
            )));
        }
        Ok(())
    }
}

fn memory(caller: &mut Caller<'_, StoreData>) -> std::result::Result<Memory, HostTrap> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| HostTrap::Abi("module does not export memory".to_string()))
}

fn guest_len(len: i32) -> std::result::Result<usize, HostTrap> {
    usize::try_from(len).map_err(|_| HostTrap::Abi(format!("negative length {len}")))
}

fn read_guest(
    caller: &mut Caller<'_, StoreData>,
    ptr: i32,
    len: i32,
) -> std::result::Result<Vec<u8>, HostTrap> {
    let len = guest_len(len)?;
    let max = caller.data().host.max_buffer;
    if len > max {
        return Err(HostTrap::ResourceExceeded(format!(
            "buffer of {len} bytes exceeds {max} byte limit"
        )));
    }
    let mem = memory(caller)?;
    let mut buf = vec![0u8; len];
    mem.read(&*caller, ptr as u32 as usize, &mut buf)
        .map_err(|_| HostTrap::Abi("guest buffer out of bounds".to_string()))?;
    Ok(buf)
}

fn read_guest_str(
    caller: &mut Caller<'_, StoreData>,
    ptr: i32,
    len: i32,
) -> std::result::Result<String, HostTrap> {
    let bytes = read_guest(caller, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_guest(
    caller: &mut Caller<'_, StoreData>,
    ptr: i32,
    bytes: &[u8],
) -> std::result::Result<(), HostTrap> {
    let mem = memory(caller)?;
    mem.write(&mut *caller, ptr as u32 as usize, bytes)
        .map_err(|_| HostTrap::Abi("guest buffer out of bounds".to_string()))
}

/// Register the gateway host functions.
pub fn add_to_linker(linker: &mut Linker<StoreData>) -> anyhow::Result<()> {
    linker.func_wrap(
        GATEWAY_MODULE,
        "raise",
        |mut caller: Caller<'_, StoreData>,
         type_ptr: i32,
         type_len: i32,
         msg_ptr: i32,
         msg_len: i32|
         -> anyhow::Result<()> {
            let exception_type = read_guest_str(&mut caller, type_ptr, type_len)?;
            let message = read_guest_str(&mut caller, msg_ptr, msg_len)?;
            Err(HostTrap::Raised {
                exception_type,
                message,
            }
            .into())
        },
    )?;

    linker.func_wrap(
        GATEWAY_MODULE,
        "log",
        |mut caller: Caller<'_, StoreData>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let line = read_guest_str(&mut caller, ptr, len)?;
            tracing::debug!(target: "gateway::guest", call = %caller.data().host.label, "{}", line);
            Ok(())
        },
    )?;

    linker.func_wrap(
        GATEWAY_MODULE,
        "fs_open",
        |mut caller: Caller<'_, StoreData>, ptr: i32, len: i32, mode: i32| -> anyhow::Result<i32> {
            let path = read_guest_str(&mut caller, ptr, len)?;
            Ok(caller.data_mut().host.open(&path, mode)?)
        },
    )?;

    linker.func_wrap(
        GATEWAY_MODULE,
        "fs_read",
        |mut caller: Caller<'_, StoreData>, handle: i32, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let len = guest_len(len)?;
            let Some(bytes) = caller.data_mut().host.read(handle, len)? else {
                return Ok(-1);
            };
            write_guest(&mut caller, ptr, &bytes)?;
            Ok(bytes.len() as i32)
        },
    )?;

    linker.func_wrap(
        GATEWAY_MODULE,
        "fs_write",
        |mut caller: Caller<'_, StoreData>, handle: i32, ptr: i32, len: i32| -> anyhow::Result<i32> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            Ok(caller.data_mut().host.write(handle, &bytes)?)
        },
    )?;

    linker.func_wrap(
        GATEWAY_MODULE,
        "fs_close",
        |mut caller: Caller<'_, StoreData>, handle: i32| -> anyhow::Result<i32> {
            Ok(caller.data_mut().host.close(handle))
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn state(max_open: usize) -> (tempfile::TempDir, tempfile::TempDir, HostState) {
        let modules = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        fs::write(modules.path().join("data.json"), r#"{"ok":true}"#).unwrap();
        let host = HostState::new(
            fs::canonicalize(modules.path()).unwrap(),
            Some(fs::canonicalize(scratch.path()).unwrap()),
            max_open,
            1024,
            "test::call",
        );
        (modules, scratch, host)
    }

    #[test]
    fn test_read_module_file() {
        let (_m, _s, mut host) = state(4);
        let h = host.open("/modules/data.json", 0).unwrap();
        assert!(h >= 3);
        let bytes = host.read(h, 64).unwrap().unwrap();
        assert_eq!(bytes, br#"{"ok":true}"#);
        assert_eq!(host.close(h), 0);
        assert_eq!(host.close(h), -1);
    }

    #[test]
    fn test_module_mount_is_read_only() {
        let (_m, _s, mut host) = state(4);
        assert!(matches!(
            host.open("/modules/data.json", 1),
            Err(HostTrap::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_scratch_round_trip() {
        let (_m, scratch, mut host) = state(4);
        let h = host.open("/scratch/out.txt", 1).unwrap();
        assert_eq!(host.write(h, b"hello").unwrap(), 5);
        host.close(h);
        assert_eq!(
            fs::read_to_string(scratch.path().join("out.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_outside_paths_denied() {
        let (_m, _s, mut host) = state(4);
        for path in ["/etc/passwd", "/modules/../etc/passwd", "/scratch/../../x", "relative.txt"] {
            assert!(
                matches!(host.open(path, 0), Err(HostTrap::PermissionDenied(_))),
                "{path} should be denied"
            );
        }
    }

    #[test]
    fn test_missing_file_returns_minus_one() {
        let (_m, _s, mut host) = state(4);
        assert_eq!(host.open("/modules/nope.json", 0).unwrap(), -1);
    }

    #[test]
    fn test_handle_ceiling() {
        let (_m, _s, mut host) = state(2);
        host.open("/modules/data.json", 0).unwrap();
        host.open("/modules/data.json", 0).unwrap();
        assert!(matches!(
            host.open("/modules/data.json", 0),
            Err(HostTrap::ResourceExceeded(_))
        ));
        assert_eq!(host.open_handles(), 2);
    }

    #[test]
    fn test_buffer_ceiling() {
        let (_m, _s, mut host) = state(2);
        let h = host.open("/modules/data.json", 0).unwrap();
        assert!(matches!(
            host.read(h, 4096),
            Err(HostTrap::ResourceExceeded(_))
        ));
    }

    #[test]
    fn test_write_through_read_handle_denied() {
        let (_m, _s, mut host) = state(2);
        let h = host.open("/modules/data.json", 0).unwrap();
        assert!(matches!(
            host.write(h, b"x"),
            Err(HostTrap::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_no_scratch_mount() {
        let modules = tempfile::tempdir().unwrap();
        let mut host = HostState::new(
            fs::canonicalize(modules.path()).unwrap(),
            None,
            4,
            1024,
            "test::call",
        );
        assert!(matches!(
            host.open("/scratch/x", 1),
            Err(HostTrap::PermissionDenied(_))
        ));
    }
}
