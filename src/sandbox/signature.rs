//! Declared function signatures and parameter validation.
//!
//! Modules declare their callable functions in a `gateway.signatures`
//! custom section. Only declared functions can be invoked.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{GatewayError, Result};

/// Name of the custom section carrying the signature table.
pub const SIGNATURE_SECTION: &str = "gateway.signatures";

/// Parameter keys that never reach a module.
const RESERVED_KEYS: &[&str] = &["admin", "system"];

/// JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "dict")]
    Object,
    Any,
}

impl ParamType {
    /// Whether `value` is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::Any => "any",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ParamSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

/// A declared, callable function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    #[serde(default)]
    pub doc: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

/// Whether a parameter key is privileged and must be rejected outright.
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("__")
        || RESERVED_KEYS
            .iter()
            .any(|reserved| key.eq_ignore_ascii_case(reserved))
}

/// Reject any privileged key.
pub fn screen_reserved_keys(params: &Map<String, Value>) -> Result<()> {
    if let Some(key) = params.keys().find(|k| is_reserved_key(k)) {
        return Err(GatewayError::Validation(format!(
            "parameter '{key}' is reserved"
        )));
    }
    Ok(())
}

/// Validate a parameter map against a declared parameter list.
///
/// Every key must be declared, every required parameter present, and every
/// value of the declared type. `context` names the callee in messages.
pub fn validate_params(
    context: &str,
    declared: &[ParamSpec],
    params: &Map<String, Value>,
) -> Result<()> {
    screen_reserved_keys(params)?;

    for key in params.keys() {
        if !declared.iter().any(|p| &p.name == key) {
            return Err(GatewayError::Validation(format!(
                "unknown parameter '{key}' for {context}"
            )));
        }
    }

    for spec in declared {
        match params.get(&spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err(GatewayError::Validation(format!(
                    "missing required parameter '{}' for {context}",
                    spec.name
                )));
            }
            Some(value) if !value.is_null() && !spec.ty.accepts(value) => {
                return Err(GatewayError::Validation(format!(
                    "parameter '{}' for {context} must be {}",
                    spec.name,
                    spec.ty.name()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse the signature table from raw section bytes.
pub fn parse_signature_section(data: &[u8]) -> Result<Vec<FunctionSignature>> {
    let signatures: Vec<FunctionSignature> = serde_json::from_slice(data).map_err(|e| {
        GatewayError::Load(format!("malformed {SIGNATURE_SECTION} section: {e}"))
    })?;

    for (i, sig) in signatures.iter().enumerate() {
        if signatures[..i].iter().any(|s| s.name == sig.name) {
            return Err(GatewayError::Load(format!(
                "function '{}' is declared twice",
                sig.name
            )));
        }
        for (j, param) in sig.params.iter().enumerate() {
            if is_reserved_key(&param.name) {
                return Err(GatewayError::Load(format!(
                    "function '{}' declares reserved parameter '{}'",
                    sig.name, param.name
                )));
            }
            if sig.params[..j].iter().any(|p| p.name == param.name) {
                return Err(GatewayError::Load(format!(
                    "function '{}' declares parameter '{}' twice",
                    sig.name, param.name
                )));
            }
        }
    }
    Ok(signatures)
}

/// Extract the signature table from a wasm binary.
pub fn extract_signatures(binary: &[u8]) -> Result<Vec<FunctionSignature>> {
    for payload in wasmparser::Parser::new(0).parse_all(binary) {
        let payload = payload.map_err(|e| GatewayError::Load(format!("invalid module: {e}")))?;
        if let wasmparser::Payload::CustomSection(reader) = payload {
            if reader.name() == SIGNATURE_SECTION {
                return parse_signature_section(reader.data());
            }
        }
    }
    Err(GatewayError::Load(format!(
        "module has no {SIGNATURE_SECTION} section"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_params() -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("query", ParamType::String),
            ParamSpec::optional("limit", ParamType::Integer),
        ]
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_params() {
        let params = map(json!({ "query": "standup", "limit": 5 }));
        validate_params("search", &search_params(), &params).unwrap();

        let params = map(json!({ "query": "standup" }));
        validate_params("search", &search_params(), &params).unwrap();
    }

    #[test]
    fn test_unknown_param_rejected() {
        let params = map(json!({ "query": "x", "verbose": true }));
        let err = validate_params("search", &search_params(), &params).unwrap_err();
        assert!(err.to_string().contains("unknown parameter 'verbose'"));
    }

    #[test]
    fn test_missing_required_rejected() {
        let params = map(json!({ "limit": 3 }));
        let err = validate_params("search", &search_params(), &params).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(err.to_string().contains("missing required parameter 'query'"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let params = map(json!({ "query": "x", "limit": "five" }));
        let err = validate_params("search", &search_params(), &params).unwrap_err();
        assert!(err.to_string().contains("must be integer"));
    }

    #[test]
    fn test_reserved_keys() {
        assert!(is_reserved_key("__class__"));
        assert!(is_reserved_key("admin"));
        assert!(is_reserved_key("SYSTEM"));
        assert!(!is_reserved_key("system_prompt"));
        assert!(!is_reserved_key("_private"));

        let params = map(json!({ "query": "x", "__globals__": {} }));
        let err = validate_params("search", &search_params(), &params).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_parse_section_with_aliases() {
        let data = br#"[{"name":"estimate","doc":"Estimate effort.","params":[
            {"name":"task","type":"str"},
            {"name":"factor","type":"float","required":false}]}]"#;
        let sigs = parse_signature_section(data).unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].params[0].ty, ParamType::String);
        assert!(sigs[0].params[0].required);
        assert_eq!(sigs[0].params[1].ty, ParamType::Number);
        assert!(!sigs[0].params[1].required);
    }

    #[test]
    fn test_parse_section_rejects_duplicates() {
        let data = br#"[{"name":"a"},{"name":"a"}]"#;
        assert!(matches!(
            parse_signature_section(data),
            Err(GatewayError::Load(_))
        ));

        let data = br#"[{"name":"a","params":[{"name":"__x","type":"any"}]}]"#;
        assert!(matches!(
            parse_signature_section(data),
            Err(GatewayError::Load(_))
        ));
    }

    #[test]
    fn test_extract_from_wat() {
        let binary = wat::parse_str(
            r#"(module (@custom "gateway.signatures" "[{\"name\":\"ping\",\"doc\":\"Health check.\"}]"))"#,
        )
        .unwrap();
        let sigs = extract_signatures(&binary).unwrap();
        assert_eq!(sigs[0].name, "ping");
        assert_eq!(sigs[0].doc, "Health check.");
    }

    #[test]
    fn test_missing_section_is_load_error() {
        let binary = wat::parse_str("(module)").unwrap();
        assert!(matches!(
            extract_signatures(&binary),
            Err(GatewayError::Load(_))
        ));
    }
}
