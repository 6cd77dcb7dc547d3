//! Request/body collaborator seam (spec.md §6, SPEC_FULL §8)
//!
//! Translating an Anthropic-shaped request body into the upstream Cloud
//! Code payload is explicitly out of scope (spec.md §1): the executor only
//! needs *something* that implements [`RequestBuilder`] to drive its
//! attempt loop in tests and in the binary. `PassthroughRequestBuilder`
//! forwards the Anthropic body unchanged plus the resolved project id —
//! a "no translation" stance.

use serde_json::Value;

/// The inbound Anthropic-compatible Messages request, opaque beyond the
/// fields the executor itself must branch on.
#[derive(Debug, Clone)]
pub struct AnthropicRequest {
    pub body: Value,
}

impl AnthropicRequest {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    pub fn model(&self) -> &str {
        self.body.get("model").and_then(Value::as_str).unwrap_or("")
    }

    /// Whether the client asked for a streamed response. Thinking-class
    /// models always stream regardless of this flag (spec.md §6).
    pub fn wants_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Whether `model` is a "thinking-class" model, which spec.md §6 always
/// routes through the streaming endpoint even for a non-streaming client
/// request.
pub fn is_thinking_class_model(model: &str) -> bool {
    model.contains("thinking")
}

/// Builds the model-specific upstream payload from `(request, project_id)`.
/// Pluggable so tests can inject deterministic fixtures without a real
/// translation layer.
pub trait RequestBuilder: Send + Sync {
    fn build(&self, req: &AnthropicRequest, project_id: &str) -> Value;
}

/// Forwards the Anthropic body unchanged, wrapped with the resolved
/// project id under `project`, since the real upstream translation is out
/// of this core's scope.
pub struct PassthroughRequestBuilder;

impl RequestBuilder for PassthroughRequestBuilder {
    fn build(&self, req: &AnthropicRequest, project_id: &str) -> Value {
        let mut body = req.body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("project".to_string(), Value::String(project_id.to_string()));
        }
        body
    }
}
