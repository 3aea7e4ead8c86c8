//! Output filtering: redaction, truncation, token estimation and the
//! response envelope.
//!
//! Nothing produced by a guest reaches the caller without passing through
//! [`OutputFilter`]. Key rules match on a normalized field name; value rules
//! match the shape of string values and field names wherever they appear,
//! so renaming a field does not let a secret through.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, GatewayError, Result};
use crate::sandbox::executor::{ExecutionResult, Outcome};

const MASK: &str = "***REDACTED***";

/// What happens to a matched field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    /// Replace the value with a fixed mask.
    Mask,
    /// Replace the value with a stable opaque placeholder.
    Tokenize,
    /// Remove the field (or array element) entirely.
    Drop,
}

/// What a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTarget {
    /// `pattern` is a substring of the normalized key (lower-cased, `-`,
    /// `_` and spaces removed).
    Key,
    /// `pattern` is a regular expression searched in string values.
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    pub name: String,
    #[serde(rename = "match")]
    pub target: MatchTarget,
    pub pattern: String,
    pub policy: ReplacementPolicy,
}

impl RedactionRule {
    pub fn key(name: &str, pattern: &str, policy: ReplacementPolicy) -> Self {
        Self {
            name: name.to_string(),
            target: MatchTarget::Key,
            pattern: pattern.to_string(),
            policy,
        }
    }

    pub fn value(name: &str, pattern: &str, policy: ReplacementPolicy) -> Self {
        Self {
            name: name.to_string(),
            target: MatchTarget::Value,
            pattern: pattern.to_string(),
            policy,
        }
    }
}

/// Built-in secret patterns.
pub fn default_rules() -> Vec<RedactionRule> {
    use ReplacementPolicy::{Mask, Tokenize};

    let keys = [
        "api_key",
        "apikey",
        "password",
        "passwd",
        "secret",
        "token",
        "access_token",
        "refresh_token",
        "private_key",
        "credential",
        "authorization",
        "cookie",
        "session_key",
    ];
    let mut rules: Vec<RedactionRule> = keys
        .iter()
        .map(|k| RedactionRule::key(k, k, Mask))
        .collect();

    rules.extend([
        RedactionRule::value(
            "jwt",
            r"eyJ[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}\.[A-Za-z0-9_-]{5,}",
            Tokenize,
        ),
        RedactionRule::value("sk_api_key", r"\bsk-[A-Za-z0-9_-]{16,}", Tokenize),
        RedactionRule::value("aws_access_key_id", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", Tokenize),
        RedactionRule::value("github_token", r"\bgh[pousr]_[A-Za-z0-9]{36,}", Tokenize),
        RedactionRule::value("slack_token", r"\bxox[abposr]-[A-Za-z0-9-]{10,}", Tokenize),
        RedactionRule::value("pem_private_key", r"-----BEGIN [A-Z ]*PRIVATE KEY-----", Mask),
        RedactionRule::value("bearer", r"(?i)\bbearer\s+[A-Za-z0-9._~+/-]{16,}=*", Mask),
    ]);
    rules
}

/// Output filter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Largest serialized result returned before truncation.
    pub max_result_bytes: usize,
    pub rules: Vec<RedactionRule>,
    /// Salt for tokenized placeholders. A random salt is used when unset,
    /// so placeholders are stable only within one gateway instance.
    pub tokenize_salt: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_result_bytes: 32 * 1024,
            rules: default_rules(),
            tokenize_salt: None,
        }
    }
}

#[derive(Debug)]
enum CompiledMatcher {
    Key(String),
    Value(Regex),
}

#[derive(Debug)]
struct CompiledRule {
    name: String,
    matcher: CompiledMatcher,
    policy: ReplacementPolicy,
}

/// A filtered result.
#[derive(Debug, Clone, PartialEq)]
pub struct Filtered {
    pub value: Value,
    /// Number of fields or elements redacted.
    pub redactions: usize,
    pub truncated: bool,
    pub approx_tokens: u64,
}

/// Envelope status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// The uniform response returned for every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    pub elapsed_ms: u64,
    pub approx_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<u64>,
}

impl Envelope {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn with_execution_id(mut self, id: u64) -> Self {
        self.execution_id = Some(id);
        self
    }
}

/// Approximate token cost of a text, at four characters per token.
pub fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

/// Redacts, truncates and wraps execution output.
#[derive(Debug)]
pub struct OutputFilter {
    rules: Vec<CompiledRule>,
    max_result_bytes: usize,
    salt: String,
}

impl OutputFilter {
    /// Compile the configured rules. An invalid pattern is a `ConfigError`.
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let matcher = match rule.target {
                    MatchTarget::Key => CompiledMatcher::Key(normalize_key(&rule.pattern)),
                    MatchTarget::Value => {
                        CompiledMatcher::Value(Regex::new(&rule.pattern).map_err(|e| {
                            GatewayError::Config(format!("redaction rule '{}': {e}", rule.name))
                        })?)
                    }
                };
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    matcher,
                    policy: rule.policy,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            max_result_bytes: config.max_result_bytes.max(128),
            salt: config
                .tokenize_salt
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        })
    }

    /// Redact, then truncate, then estimate.
    pub fn filter(&self, raw: &Value) -> Filtered {
        let mut redactions = 0;
        let redacted = self.redact(raw, &mut redactions).unwrap_or(Value::Null);
        let (value, truncated) = self.truncate(redacted);
        let approx_tokens = approx_tokens(&value.to_string());
        Filtered {
            value,
            redactions,
            truncated,
            approx_tokens,
        }
    }

    /// Apply value-shape rules to free text such as error messages.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            if let CompiledMatcher::Value(re) = &rule.matcher {
                if re.is_match(&out) {
                    out = re
                        .replace_all(&out, |caps: &regex::Captures<'_>| match rule.policy {
                            ReplacementPolicy::Tokenize => self.token(&caps[0]),
                            _ => MASK.to_string(),
                        })
                        .into_owned();
                }
            }
        }
        out
    }

    /// Wrap an execution result.
    pub fn envelope(&self, result: &ExecutionResult) -> Envelope {
        match &result.outcome {
            Outcome::Success(value) => {
                let filtered = self.filter(value);
                if filtered.redactions > 0 {
                    tracing::debug!(redactions = filtered.redactions, "result redacted");
                }
                Envelope {
                    status: Status::Success,
                    result: Some(filtered.value),
                    error: None,
                    error_kind: None,
                    exception_type: None,
                    traceback: None,
                    truncated: filtered.truncated,
                    elapsed_ms: result.elapsed_ms,
                    approx_tokens: filtered.approx_tokens,
                    execution_id: None,
                }
            }
            Outcome::Failure(failure) => self.error_envelope(
                failure.kind,
                &failure.message,
                failure.exception_type.as_deref(),
                failure.traceback.as_deref(),
                result.elapsed_ms,
            ),
        }
    }

    /// Wrap an error raised before or around execution.
    pub fn reject(&self, err: &GatewayError, elapsed_ms: u64) -> Envelope {
        match err {
            GatewayError::Execution {
                exception_type,
                message,
                traceback,
            } => self.error_envelope(
                ErrorKind::ExecutionError,
                message,
                Some(exception_type),
                traceback.as_deref(),
                elapsed_ms,
            ),
            other => self.error_envelope(other.kind(), &other.message(), None, None, elapsed_ms),
        }
    }

    fn error_envelope(
        &self,
        kind: ErrorKind,
        message: &str,
        exception_type: Option<&str>,
        traceback: Option<&str>,
        elapsed_ms: u64,
    ) -> Envelope {
        // Internal failures may carry host paths; callers get a fixed text.
        let error = if kind == ErrorKind::InternalError {
            "internal error".to_string()
        } else {
            self.scrub_text(message)
        };
        let traceback = traceback.map(|tb| self.scrub_text(tb));
        let approx = approx_tokens(&error) + traceback.as_deref().map_or(0, approx_tokens);
        Envelope {
            status: Status::Error,
            result: None,
            error: Some(error),
            error_kind: Some(kind),
            exception_type: exception_type.map(str::to_string),
            traceback,
            truncated: false,
            elapsed_ms,
            approx_tokens: approx,
            execution_id: None,
        }
    }

    /// `None` means the value was dropped.
    fn redact(&self, value: &Value, count: &mut usize) -> Option<Value> {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    // A field name can itself be a secret.
                    let name = match self.value_rule(key) {
                        Some(rule) => {
                            *count += 1;
                            tracing::trace!(rule = %rule.name, "field name redacted");
                            match rule.policy {
                                ReplacementPolicy::Drop => continue,
                                ReplacementPolicy::Mask => vacant_key(&out, MASK),
                                ReplacementPolicy::Tokenize => vacant_key(&out, &self.token(key)),
                            }
                        }
                        None => key.clone(),
                    };
                    if let Some(rule) = self.key_rule(key) {
                        *count += 1;
                        tracing::trace!(rule = %rule.name, "field redacted");
                        match rule.policy {
                            ReplacementPolicy::Drop => {}
                            ReplacementPolicy::Mask => {
                                out.insert(name, Value::String(MASK.to_string()));
                            }
                            ReplacementPolicy::Tokenize => {
                                out.insert(name, Value::String(self.token(&child.to_string())));
                            }
                        }
                        continue;
                    }
                    if let Some(redacted) = self.redact(child, count) {
                        out.insert(name, redacted);
                    }
                }
                Some(Value::Object(out))
            }
            Value::Array(items) => Some(Value::Array(
                items.iter().filter_map(|item| self.redact(item, count)).collect(),
            )),
            Value::String(s) => match self.value_rule(s) {
                Some(rule) => {
                    *count += 1;
                    tracing::trace!(rule = %rule.name, "value redacted");
                    match rule.policy {
                        ReplacementPolicy::Drop => None,
                        ReplacementPolicy::Mask => Some(Value::String(MASK.to_string())),
                        ReplacementPolicy::Tokenize => Some(Value::String(self.token(s))),
                    }
                }
                None => Some(value.clone()),
            },
            _ => Some(value.clone()),
        }
    }

    fn key_rule(&self, key: &str) -> Option<&CompiledRule> {
        let normalized = normalize_key(key);
        self.rules.iter().find(|rule| match &rule.matcher {
            CompiledMatcher::Key(pattern) => normalized.contains(pattern.as_str()),
            CompiledMatcher::Value(_) => false,
        })
    }

    fn value_rule(&self, value: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| match &rule.matcher {
            CompiledMatcher::Value(re) => re.is_match(value),
            CompiledMatcher::Key(_) => false,
        })
    }

    fn token(&self, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(secret.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("[TOKEN:{}]", &digest[..12])
    }

    fn truncate(&self, value: Value) -> (Value, bool) {
        let serialized = value.to_string();
        let total = serialized.len();
        if total <= self.max_result_bytes {
            return (value, false);
        }

        match value {
            Value::Array(items) => {
                let count = items.len();
                let marker_budget = truncation_marker(count, total).to_string().len() + 1;
                let budget = self.max_result_bytes.saturating_sub(marker_budget + 2);
                let mut used = 0;
                let mut kept = Vec::new();
                for item in items {
                    let len = item.to_string().len() + usize::from(!kept.is_empty());
                    if used + len > budget {
                        break;
                    }
                    used += len;
                    kept.push(item);
                }
                let omitted = count - kept.len();
                kept.push(truncation_marker(omitted, total));
                (Value::Array(kept), true)
            }
            // Budgets below count the prefix as it will be escaped on the
            // wire, plus the two enclosing quotes. The suffix is sized for
            // the widest `omitted` it can carry.
            Value::String(s) => {
                let suffix = format!("...[truncated: {} bytes omitted]", s.len()).len();
                let keep = escaped_prefix(&s, self.max_result_bytes.saturating_sub(suffix + 2));
                let omitted = s.len() - keep;
                (
                    Value::String(format!("{}...[truncated: {omitted} bytes omitted]", &s[..keep])),
                    true,
                )
            }
            _ => {
                let suffix = format!("...[truncated: {total} of {total} bytes omitted]").len();
                let keep =
                    escaped_prefix(&serialized, self.max_result_bytes.saturating_sub(suffix + 2));
                let omitted = total - keep;
                (
                    Value::String(format!(
                        "{}...[truncated: {omitted} of {total} bytes omitted]",
                        &serialized[..keep]
                    )),
                    true,
                )
            }
        }
    }
}

fn truncation_marker(omitted_items: usize, original_bytes: usize) -> Value {
    serde_json::json!({
        "__truncated__": true,
        "omitted_items": omitted_items,
        "original_bytes": original_bytes,
    })
}

/// Byte length of the longest char prefix of `s` whose JSON string escape
/// fits in `budget` bytes.
fn escaped_prefix(s: &str, budget: usize) -> usize {
    let mut used = 0;
    for (idx, c) in s.char_indices() {
        let width = match c {
            '"' | '\\' | '\n' | '\r' | '\t' | '\u{8}' | '\u{c}' => 2,
            c if (c as u32) < 0x20 => 6,
            c => c.len_utf8(),
        };
        if used + width > budget {
            return idx;
        }
        used += width;
    }
    s.len()
}

/// `base`, or `base#n` for the first `n` not already present.
fn vacant_key(map: &Map<String, Value>, base: &str) -> String {
    let mut candidate = base.to_string();
    let mut n = 1;
    while map.contains_key(&candidate) {
        n += 1;
        candidate = format!("{base}#{n}");
    }
    candidate
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}
