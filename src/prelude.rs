//! Prelude module for convenient imports.

pub use crate::error::{ErrorKind, GatewayError, Result};
pub use crate::filter::{Envelope, Status};
pub use crate::router::{Gateway, OperationCatalog, OperationSpec};
pub use crate::sandbox::{ParamSpec, ParamType, SandboxConfig};
pub use crate::GatewayConfig;
