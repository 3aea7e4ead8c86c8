//! Sandbox module containing all execution-related components.

pub mod cache;
pub mod config;
pub mod executor;
pub mod host;
pub mod io;
pub mod isolation;
pub mod limits;
pub mod signature;

pub use cache::{CacheStats, ModuleCache, ModuleEntry, SharedEngine};
pub use config::{SandboxConfig, SandboxConfigBuilder};
pub use executor::{
    BoundaryLimits, ExecutionFailure, ExecutionResult, Executor, Outcome, PreparedCall,
};
pub use isolation::{ExecutionState, Lifecycle, Sandbox};
pub use signature::{FunctionSignature, ParamSpec, ParamType};
