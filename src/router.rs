//! The public entry point: a closed operation catalog and the invocation
//! pipeline.
//!
//! Only operations listed in the [`OperationCatalog`] are reachable. The
//! catalog is never filled in by scanning modules; whatever the module index
//! can see is irrelevant until someone adds it here.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::audit::{self, AuditEvent, AuditLog, OutcomeClass};
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::filter::{Envelope, OutputFilter};
use crate::index::{discovery_response, normalize_relative, Listing, ModuleIndex};
use crate::limiter::RateLimiter;
use crate::sandbox::cache::{CacheStats, ModuleCache, SharedEngine};
use crate::sandbox::isolation::{ExecutionState, Lifecycle, Sandbox};
use crate::sandbox::signature::{is_reserved_key, screen_reserved_keys, validate_params};
use crate::sandbox::{FunctionSignature, ParamSpec, PreparedCall};

/// One callable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Stable public name, e.g. `episodic.search`.
    pub name: String,
    /// Module file, relative to the module root.
    pub module_path: String,
    pub function: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Versioned table of everything the gateway will run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCatalog {
    pub version: String,
    pub paradigm: String,
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl OperationCatalog {
    /// An empty catalog.
    pub fn new(version: impl Into<String>, paradigm: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            paradigm: paradigm.into(),
            operations: Vec::new(),
        }
    }

    /// Add an operation (builder style). Validated by [`Gateway::new`].
    pub fn with_operation(mut self, operation: OperationSpec) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let catalog: Self =
            toml::from_str(s).map_err(|e| GatewayError::Config(format!("invalid catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let catalog: Self = serde_json::from_str(s)
            .map_err(|e| GatewayError::Config(format!("invalid catalog: {e}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check names, paths and parameter lists.
    pub fn validate(&self) -> Result<()> {
        for (i, op) in self.operations.iter().enumerate() {
            if op.name.trim().is_empty() || op.function.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "operation #{} needs a name and a function",
                    i + 1
                )));
            }
            if self.operations[..i].iter().any(|o| o.name == op.name) {
                return Err(GatewayError::Config(format!(
                    "operation '{}' is listed twice",
                    op.name
                )));
            }
            normalize_relative(&op.module_path).map_err(|_| {
                GatewayError::Config(format!(
                    "operation '{}' has an invalid module path",
                    op.name
                ))
            })?;
            for (j, param) in op.parameters.iter().enumerate() {
                if is_reserved_key(&param.name) {
                    return Err(GatewayError::Config(format!(
                        "operation '{}' declares reserved parameter '{}'",
                        op.name, param.name
                    )));
                }
                if op.parameters[..j].iter().any(|p| p.name == param.name) {
                    return Err(GatewayError::Config(format!(
                        "operation '{}' declares parameter '{}' twice",
                        op.name, param.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Catalog entry plus what the module itself declares.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationDescription {
    pub operation: OperationSpec,
    pub signature: FunctionSignature,
}

/// The execution gateway.
///
/// `invoke` drives rate limiting, validation, module resolution, sandboxed
/// execution, output filtering and auditing. Every call gets exactly one
/// audit record, whatever happens.
#[derive(Debug)]
pub struct Gateway {
    catalog: OperationCatalog,
    index: ModuleIndex,
    cache: ModuleCache,
    sandbox: Sandbox,
    filter: OutputFilter,
    limiter: RateLimiter,
    audit: AuditLog,
}

impl Gateway {
    pub fn new(config: GatewayConfig, catalog: OperationCatalog) -> Result<Self> {
        config.validate()?;
        catalog.validate()?;

        let index = ModuleIndex::new(&config.module_root, config.max_read_bytes)?;
        let engine = SharedEngine::new(&config.sandbox)?;
        let cache = ModuleCache::new(engine.clone(), index.clone(), config.cache_capacity);
        let sandbox = Sandbox::new(config.sandbox.clone(), engine, index.root())?;
        let filter = OutputFilter::new(&config.filter)?;
        let limiter = RateLimiter::new(config.rate_limit.clone());
        let audit = AuditLog::from_config(&config.audit)?;

        tracing::info!(
            operations = catalog.len(),
            version = %catalog.version,
            paradigm = %catalog.paradigm,
            "gateway ready"
        );

        Ok(Self {
            catalog,
            index,
            cache,
            sandbox,
            filter,
            limiter,
            audit,
        })
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    /// Catalog entry and module-declared signature, without executing.
    pub fn describe(&self, operation: &str) -> Result<OperationDescription> {
        let spec = self.lookup(operation)?;
        let signature = self.cache.get_signature(&spec.module_path, &spec.function)?;
        Ok(OperationDescription {
            operation: spec.clone(),
            signature,
        })
    }

    /// List a directory of the module tree.
    pub fn list(&self, path: &str) -> Result<Listing> {
        self.index.list(path)
    }

    /// Read a file of the module tree.
    pub fn read(&self, path: &str) -> Result<Listing> {
        self.index.read(path)
    }

    /// [`list`](Self::list) as a discovery JSON response.
    pub fn list_json(&self, path: &str) -> Value {
        discovery_response(self.list(path))
    }

    /// [`read`](Self::read) as a discovery JSON response.
    pub fn read_json(&self, path: &str) -> Value {
        discovery_response(self.read(path))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run `operation` for `identity`. Always returns an envelope.
    pub async fn invoke(
        &self,
        operation: &str,
        params: Map<String, Value>,
        identity: &str,
    ) -> Envelope {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "gateway.invoke",
            operation,
            identity,
            request_id = %request_id
        );
        self.invoke_inner(operation, params, identity, request_id)
            .instrument(span)
            .await
    }

    async fn invoke_inner(
        &self,
        operation: &str,
        params: Map<String, Value>,
        identity: &str,
        request_id: String,
    ) -> Envelope {
        let started = Instant::now();
        let mut lifecycle = Lifecycle::new(request_id);
        lifecycle.advance(ExecutionState::Validating);

        let spec = self.catalog.get(operation);
        let call_hash = match spec {
            Some(spec) => audit::call_hash(&spec.module_path, &spec.function, &params),
            None => audit::call_hash("", operation, &params),
        };
        let pending = PendingAudit {
            audit: &self.audit,
            operation,
            identity,
            call_hash: Some(call_hash),
            started,
        };

        let envelope = match self.prepare(operation, &params, identity) {
            Ok(call) => {
                lifecycle.advance(ExecutionState::Running);
                let result = self.sandbox.run(call).await;
                lifecycle.advance(ExecutionState::after_run(&result.outcome));
                self.filter.envelope(&result)
            }
            Err(err) => {
                lifecycle.advance(ExecutionState::Rejected);
                tracing::warn!(kind = %err.kind(), error = %err, "request rejected");
                self.filter.reject(&err, started.elapsed().as_millis() as u64)
            }
        };

        let envelope = match pending.complete(&envelope) {
            Ok(execution_id) => envelope.with_execution_id(execution_id),
            Err(err) => {
                tracing::error!(error = %err, "audit append failed");
                self.filter.reject(&err, started.elapsed().as_millis() as u64)
            }
        };

        match envelope.error_kind {
            Some(kind @ (ErrorKind::TimeoutError | ErrorKind::ResourceExceeded | ErrorKind::PermissionDenied)) => {
                tracing::warn!(
                    kind = %kind,
                    elapsed_ms = envelope.elapsed_ms,
                    "sandbox forced termination"
                );
            }
            _ => {}
        }
        tracing::info!(
            event = "invoke.completed",
            state = %lifecycle.state(),
            status = ?envelope.status,
            elapsed_ms = envelope.elapsed_ms,
            approx_tokens = envelope.approx_tokens,
            execution_id = envelope.execution_id,
        );
        envelope
    }

    fn lookup(&self, operation: &str) -> Result<&OperationSpec> {
        self.catalog.get(operation).ok_or_else(|| {
            GatewayError::FunctionNotFound(format!("operation '{operation}' is not in the catalog"))
        })
    }

    /// Everything that happens before the sandbox: privileged-key
    /// screening, rate limiting, lookup, schema validation, resolution and
    /// signature checks.
    fn prepare(
        &self,
        operation: &str,
        params: &Map<String, Value>,
        identity: &str,
    ) -> Result<PreparedCall> {
        // Privileged keys never reach the limiter, so they cost no budget.
        // Unknown operation names do.
        screen_reserved_keys(params)?;
        self.limiter.check_and_increment(identity)?;
        let spec = self.lookup(operation)?;
        validate_params(&format!("operation '{operation}'"), &spec.parameters, params)?;
        let entry = self.cache.resolve(&spec.module_path)?;
        self.sandbox
            .executor()
            .prepare(entry, &spec.function, params)
    }
}

/// Audit record owed for one invocation.
///
/// Completed with the envelope on the normal path. If the invocation future
/// is dropped first (caller cancellation), the record is written on drop as
/// a timeout, matching the forced abort the sandbox performs.
struct PendingAudit<'a> {
    audit: &'a AuditLog,
    operation: &'a str,
    identity: &'a str,
    call_hash: Option<String>,
    started: Instant,
}

impl PendingAudit<'_> {
    fn event(&self, call_hash: String, envelope: Option<&Envelope>) -> AuditEvent {
        let error_kind = match envelope {
            Some(envelope) => envelope.error_kind,
            None => Some(ErrorKind::TimeoutError),
        };
        AuditEvent {
            operation: self.operation.to_string(),
            identity: self.identity.to_string(),
            call_hash,
            outcome: OutcomeClass::from_error_kind(error_kind),
            error_kind,
            elapsed_ms: envelope.map_or_else(
                || self.started.elapsed().as_millis() as u64,
                |e| e.elapsed_ms,
            ),
            result_digest: envelope.and_then(|e| e.result.as_ref()).map(audit::result_digest),
        }
    }

    /// Append the record for `envelope` and return its execution id.
    fn complete(mut self, envelope: &Envelope) -> Result<u64> {
        let call_hash = self.call_hash.take().unwrap_or_default();
        let event = self.event(call_hash, Some(envelope));
        self.audit.append(event).map(|record| record.execution_id)
    }
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        let Some(call_hash) = self.call_hash.take() else {
            return;
        };
        tracing::warn!("invocation cancelled by caller");
        let event = self.event(call_hash, None);
        if let Err(err) = self.audit.append(event) {
            tracing::error!(error = %err, "audit append failed");
        }
    }
}
