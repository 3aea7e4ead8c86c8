//! # Code Execution Gateway
//!
//! Lets an agent discover a curated catalog of narrow operations and invoke
//! them by name, with every call executed inside a WebAssembly sandbox and
//! every result filtered before it leaves.
//!
//! Operations are WebAssembly modules under a sandboxed module root. The
//! gateway:
//!
//! - **Discovers** modules through a read-only index that refuses any path
//!   escaping the root
//! - **Caches** compiled modules by content fingerprint, recompiling only
//!   when a file changes
//! - **Executes** a declared function in a fresh Wasmtime store per call,
//!   with memory, stack, buffer, collection and file-handle ceilings and a
//!   watchdog-enforced wall-clock timeout
//! - **Filters** results: secret-shaped fields are masked, tokenized or
//!   dropped, oversized results are truncated with a marker, and the token
//!   cost is estimated
//! - **Throttles** each caller identity and appends a hash-chained audit
//!   record for every attempt
//!
//! ## Example
//!
//! ```rust,ignore
//! use code_exec_gateway::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let catalog = OperationCatalog::from_toml_str(&std::fs::read_to_string("catalog.toml")?)?;
//!     let gateway = Gateway::new(GatewayConfig::new("modules"), catalog)?;
//!
//!     let params = json!({"query": "deploy", "limit": 5});
//!     let envelope = gateway
//!         .invoke("episodic.search", params.as_object().cloned().unwrap_or_default(), "agent-1")
//!         .await;
//!
//!     println!("{}", serde_json::to_string(&envelope).unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Guest ABI
//!
//! A module exports `memory`, `alloc(i32) -> i32` and one
//! `(i32 ptr, i32 len) -> i64` function per operation. Parameters go in as
//! JSON; the function returns `(ptr << 32) | len` of a JSON result. Callable
//! functions and their parameters are declared in a `gateway.signatures`
//! custom section. The `gateway` import module provides `raise`, `log` and
//! `fs_*` functions; only a short list of WASI calls is linked.
//!
//! ## Security Model
//!
//! 1. **Closed catalog**: only operations listed in the catalog are reachable
//! 2. **Import vetting**: modules importing anything outside the allow-list
//!    are refused before instantiation
//! 3. **Filesystem confinement**: `/modules` is read-only, `/scratch` is a
//!    per-call directory deleted afterwards, everything else is denied
//! 4. **Resource limits**: every ceiling is enforced independently
//! 5. **Epoch interruption**: a watchdog thread stops guests that never yield

pub mod audit;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod limiter;
pub mod prelude;
pub mod router;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use audit::{AuditConfig, AuditLog, AuditRecord, OutcomeClass};
pub use config::GatewayConfig;
pub use error::{ErrorKind, GatewayError, Result};
pub use filter::{Envelope, FilterConfig, OutputFilter, RedactionRule, ReplacementPolicy, Status};
pub use index::{Listing, ModuleIndex};
pub use limiter::{RateLimitConfig, RateLimiter, WindowPolicy};
pub use router::{Gateway, OperationCatalog, OperationDescription, OperationSpec};
pub use sandbox::cache::{ModuleCache, SharedEngine};
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::{ExecutionResult, Outcome};
