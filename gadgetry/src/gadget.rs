//! Gadget trait, registry, and execution result types.
//!
//! A gadget is a side-effectful capability the model invokes through the
//! marker wire format. Gadgets declare a JSON schema for their
//! parameters; because the wire format carries raw text, string leaves
//! are coerced to the schema-declared scalar types before validation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::executor::GadgetContext;
use crate::media::{MediaItem, MediaRef};

/// Name of the built-in gadget that pages stored oversize outputs.
pub const OUTPUT_VIEWER_NAME: &str = "GadgetOutputViewer";

/// A failure raised by a gadget's `execute`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GadgetError {
    /// Ordinary execution failure; the message becomes the result error
    /// string the model sees.
    #[error("{0}")]
    Failed(String),

    /// Distinguished signal instructing the agent loop to terminate
    /// cleanly, optionally with a final message.
    #[error("loop break requested")]
    BreakLoop {
        /// Final message to surface as the gadget's result.
        message: Option<String>,
    },
}

impl GadgetError {
    /// Create an ordinary failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a break-loop signal with a final message.
    #[must_use]
    pub fn break_loop(message: impl Into<String>) -> Self {
        Self::BreakLoop {
            message: Some(message.into()),
        }
    }
}

/// A successful gadget return value.
#[derive(Debug, Clone, Default)]
pub struct GadgetReturn {
    /// The result text fed back to the model.
    pub result: String,
    /// Cost incurred by the gadget, if any.
    pub cost: Option<f64>,
    /// Media produced by the gadget.
    pub media: Vec<MediaItem>,
}

impl GadgetReturn {
    /// Create a text-only return.
    #[must_use]
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            ..Self::default()
        }
    }

    /// Attach a cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Attach a media item.
    #[must_use]
    pub fn with_media(mut self, media: MediaItem) -> Self {
        self.media.push(media);
        self
    }
}

impl From<String> for GadgetReturn {
    fn from(result: String) -> Self {
        Self::text(result)
    }
}

impl From<&str> for GadgetReturn {
    fn from(result: &str) -> Self {
        Self::text(result)
    }
}

/// A side-effectful capability invocable by the model.
#[async_trait]
pub trait Gadget: Send + Sync {
    /// Unique gadget name as it appears in call headers.
    fn name(&self) -> &str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema for the gadget's parameters.
    fn schema(&self) -> Value;

    /// Intrinsic concurrency cap; `None` means unlimited.
    fn max_concurrent(&self) -> Option<usize> {
        None
    }

    /// Per-gadget timeout override.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute with validated parameters.
    async fn execute(
        &self,
        params: Value,
        ctx: &GadgetContext,
    ) -> std::result::Result<GadgetReturn, GadgetError>;
}

/// Name-keyed registry of available gadgets.
#[derive(Clone, Default)]
pub struct GadgetRegistry {
    gadgets: HashMap<String, Arc<dyn Gadget>>,
}

impl GadgetRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gadget under its own name. Re-registering a name
    /// replaces the previous gadget.
    pub fn register(&mut self, gadget: Arc<dyn Gadget>) {
        self.gadgets.insert(gadget.name().to_owned(), gadget);
    }

    /// Look up a gadget by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Gadget>> {
        self.gadgets.get(name).cloned()
    }

    /// Returns `true` if the name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.gadgets.contains_key(name)
    }

    /// Registered gadget names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.gadgets.keys().map(String::as_str).collect()
    }

    /// Number of registered gadgets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    /// Returns `true` if no gadgets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }
}

impl std::fmt::Debug for GadgetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GadgetRegistry")
            .field("gadgets", &self.gadgets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The outcome of one gadget invocation.
///
/// Failures are data: `error` is populated instead of `result` and the
/// model reacts to the error text on the next iteration.
#[derive(Debug, Clone)]
pub struct GadgetExecutionResult {
    /// Gadget name.
    pub gadget_name: String,
    /// Caller-visible invocation id.
    pub invocation_id: String,
    /// The parameters the gadget actually ran with.
    pub parameters: Value,
    /// Result text, when execution succeeded.
    pub result: Option<String>,
    /// Error text, when it did not.
    pub error: Option<String>,
    /// Wall-clock execution time.
    pub execution_time: Duration,
    /// Cost incurred, if any.
    pub cost: Option<f64>,
    /// References to media produced.
    pub media: Vec<MediaRef>,
    /// Set when the gadget raised the break-loop signal.
    pub breaks_loop: bool,
}

impl GadgetExecutionResult {
    /// Returns `true` when no error is recorded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The text the model will see: the result, or the error.
    #[must_use]
    pub fn visible_text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.result.as_deref())
            .unwrap_or("")
    }
}

/// Coerce string leaves of `params` to the scalar types declared by
/// `schema`.
///
/// The wire format carries every value as text; a schema declaring
/// `integer`, `number`, or `boolean` expects the typed form. Leaves that
/// fail to parse are left as strings so that validation reports them.
pub fn coerce_parameters(schema: &Value, params: &mut Value) {
    let declared = schema.get("type").and_then(Value::as_str);

    if let Value::String(s) = params {
        let coerced = match declared {
            Some("integer") => s.trim().parse::<i64>().ok().map(Value::from),
            Some("number") => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            Some("boolean") => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        if let Some(value) = coerced {
            *params = value;
        }
        return;
    }

    match params {
        Value::Object(map) => {
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, value) in map.iter_mut() {
                    if let Some(sub) = props.get(key) {
                        coerce_parameters(sub, value);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for value in items.iter_mut() {
                    coerce_parameters(item_schema, value);
                }
            }
        }
        _ => {}
    }
}

/// Validate `params` against a gadget's JSON schema.
///
/// Returns the joined validation errors on failure. A schema that cannot
/// itself be compiled validates nothing, matching lenient registry
/// behavior for hand-written schemas.
pub fn validate_parameters(schema: &Value, params: &Value) -> std::result::Result<(), String> {
    let Ok(validator) = jsonschema::validator_for(schema) else {
        return Ok(());
    };

    let errors: Vec<String> = validator.iter_errors(params).map(|e| e.to_string()).collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Probe;

    #[async_trait]
    impl Gadget for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn description(&self) -> &str {
            "test probe"
        }

        fn schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _params: Value,
            _ctx: &GadgetContext,
        ) -> std::result::Result<GadgetReturn, GadgetError> {
            Ok("ok".into())
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = GadgetRegistry::new();
        registry.register(Arc::new(Probe));
        assert!(registry.contains("probe"));
        assert!(registry.get("probe").is_some());
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn coerce_integer_leaves() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "string"}}
        });
        let mut params = json!({"a": "2", "b": "2"});
        coerce_parameters(&schema, &mut params);
        assert_eq!(params, json!({"a": 2, "b": "2"}));
    }

    #[test]
    fn coerce_nested_and_arrays() {
        let schema = json!({
            "type": "object",
            "properties": {
                "flags": {"type": "array", "items": {"type": "boolean"}},
                "inner": {"type": "object", "properties": {"n": {"type": "number"}}}
            }
        });
        let mut params = json!({"flags": ["true", "false"], "inner": {"n": "1.5"}});
        coerce_parameters(&schema, &mut params);
        assert_eq!(params, json!({"flags": [true, false], "inner": {"n": 1.5}}));
    }

    #[test]
    fn coerce_leaves_unparseable_strings_alone() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "integer"}}});
        let mut params = json!({"a": "not a number"});
        coerce_parameters(&schema, &mut params);
        assert_eq!(params, json!({"a": "not a number"}));
    }

    #[test]
    fn validate_accepts_conforming_params() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"]
        });
        assert!(validate_parameters(&schema, &json!({"a": 2})).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"]
        });
        let err = validate_parameters(&schema, &json!({})).unwrap_err();
        assert!(err.contains("required"));
    }

    #[test]
    fn visible_text_prefers_error() {
        let result = GadgetExecutionResult {
            gadget_name: "x".into(),
            invocation_id: "x1".into(),
            parameters: Value::Null,
            result: Some("fine".into()),
            error: Some("broken".into()),
            execution_time: Duration::ZERO,
            cost: None,
            media: Vec::new(),
            breaks_loop: false,
        };
        assert_eq!(result.visible_text(), "broken");
        assert!(!result.is_success());
    }
}
