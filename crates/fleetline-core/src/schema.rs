use std::collections::HashMap;

use fleetline_types::EventKind;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Array,
    Object,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub required: bool,
    pub field_type: FieldType,
}

#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    pub fields: HashMap<String, FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    /// Accepted for forward-compat but not governed by a named schema.
    Unvalidated,
    Invalid(Vec<String>),
}

/// Each registered `event_type` is associated with a declarative schema of
/// required/optional fields and their types. Registry is effectively
/// immutable after startup; unknown event types are accepted but flagged.
pub struct SchemaRegistry {
    schemas: HashMap<String, EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self { schemas: default_schemas() }
    }

    pub fn register(&mut self, event_type: impl Into<String>, schema: EventSchema) {
        self.schemas.insert(event_type.into(), schema);
    }

    pub fn validate(&self, event_type: &str, payload: &Map<String, Value>) -> ValidationOutcome {
        let Some(schema) = self.schemas.get(event_type) else {
            return ValidationOutcome::Unvalidated;
        };

        let mut violations = Vec::new();
        for (name, spec) in &schema.fields {
            match payload.get(name) {
                Some(value) if !spec.field_type.matches(value) => {
                    violations.push(format!("field `{name}` has wrong type"));
                }
                None if spec.required => {
                    violations.push(format!("missing required field `{name}`"));
                }
                _ => {}
            }
        }

        if violations.is_empty() {
            ValidationOutcome::Ok
        } else {
            ValidationOutcome::Invalid(violations)
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn field(required: bool, field_type: FieldType) -> FieldSpec {
    FieldSpec { required, field_type }
}

/// A representative subset of the closed registry (§6) with schemas
/// precise enough to exercise `validate()`; every entry maps onto a
/// variant of [`EventKind`].
fn default_schemas() -> HashMap<String, EventSchema> {
    let mut schemas = HashMap::new();

    let mut agent_invoked = EventSchema::default();
    agent_invoked.fields.insert("agent".into(), field(true, FieldType::String));
    agent_invoked.fields.insert("invoked_by".into(), field(true, FieldType::String));
    schemas.insert(EventKind::AgentInvoked.as_str().to_string(), agent_invoked);

    let mut agent_completed = EventSchema::default();
    agent_completed.fields.insert("agent".into(), field(true, FieldType::String));
    agent_completed.fields.insert("tokens_used".into(), field(false, FieldType::Number));
    schemas.insert(EventKind::AgentCompleted.as_str().to_string(), agent_completed);

    let mut agent_failed = EventSchema::default();
    agent_failed.fields.insert("agent".into(), field(true, FieldType::String));
    agent_failed.fields.insert("error".into(), field(false, FieldType::String));
    schemas.insert(EventKind::AgentFailed.as_str().to_string(), agent_failed);

    let mut tool_used = EventSchema::default();
    tool_used.fields.insert("tool".into(), field(true, FieldType::String));
    tool_used.fields.insert("success".into(), field(true, FieldType::Bool));
    schemas.insert(EventKind::ToolUsed.as_str().to_string(), tool_used);

    let mut cost_tracked = EventSchema::default();
    cost_tracked.fields.insert("model".into(), field(true, FieldType::String));
    cost_tracked.fields.insert("cost_usd".into(), field(true, FieldType::Number));
    schemas.insert(EventKind::CostTracked.as_str().to_string(), cost_tracked);

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_event_type_with_valid_payload_passes() {
        let registry = SchemaRegistry::new();
        let mut payload = Map::new();
        payload.insert("agent".into(), Value::String("a1".into()));
        payload.insert("invoked_by".into(), Value::String("u1".into()));
        assert_eq!(registry.validate("agent.invoked", &payload), ValidationOutcome::Ok);
    }

    #[test]
    fn known_event_type_missing_required_field_is_invalid() {
        let registry = SchemaRegistry::new();
        let payload = Map::new();
        match registry.validate("agent.invoked", &payload) {
            ValidationOutcome::Invalid(violations) => assert!(!violations.is_empty()),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_is_unvalidated_not_rejected() {
        let registry = SchemaRegistry::new();
        let payload = Map::new();
        assert_eq!(registry.validate("custom.thing", &payload), ValidationOutcome::Unvalidated);
    }
}
