//! Canonical byte serialization of an event's signable fields.
//!
//! The canonical form is the signing input, so it must be deterministic
//! across processes and independent of map iteration order. Every field
//! that contributes is listed explicitly so nothing is accidentally
//! omitted.
//!
//! Layout: a single JSON object serialized with `serde_json`, whose keys
//! are emitted in lexicographic order (the default `serde_json::Map` is a
//! `BTreeMap`). Rules:
//!
//! - every signable field is always present; missing optionals are emitted
//!   as an explicit JSON `null`, never omitted
//! - nested actor/target/group objects follow the same rule
//! - string-keyed mappings (`fields`, `actor_fields`, `target_fields`)
//!   are emitted with sorted keys
//! - timestamps are ISO-8601 UTC with millisecond precision
//! - `hash`, `signature`, and `metadata` are excluded
//!
//! Covered fields: id, external_id, action, crud, actor, target, group,
//! description, component, version, source_ip, is_anonymous, is_failure,
//! fields, created_at, received_at, previous_hash, project_id,
//! environment_id.

use serde_json::{Map, Value};

use crate::error::{AthanorError, Result};
use crate::types::{format_ts, Actor, AuditEvent, Group, Target};

/// Serialize the signable fields of `event` to canonical bytes.
///
/// `event.hash` and `event.signature` are ignored, so the same function
/// serves both chain construction (before they exist) and verification
/// (after they do). Structurally equal events produce byte-equal output.
pub fn canonical_event_bytes(event: &AuditEvent) -> Result<Vec<u8>> {
    let mut doc = Map::new();

    doc.insert("id".into(), Value::String(event.id.to_string()));
    doc.insert("external_id".into(), opt_string(&event.external_id));
    doc.insert("action".into(), Value::String(event.action.clone()));
    doc.insert("crud".into(), Value::String(event.crud.as_str().into()));

    doc.insert("actor".into(), actor_value(event.actor.as_ref()));
    doc.insert("target".into(), target_value(event.target.as_ref()));
    doc.insert("group".into(), group_value(event.group.as_ref()));

    doc.insert("description".into(), opt_string(&event.description));
    doc.insert("component".into(), opt_string(&event.component));
    doc.insert("version".into(), opt_string(&event.version));
    doc.insert("source_ip".into(), opt_string(&event.source_ip));
    doc.insert("is_anonymous".into(), Value::Bool(event.is_anonymous));
    doc.insert("is_failure".into(), Value::Bool(event.is_failure));

    let mut fields = Map::new();
    for (key, value) in &event.fields {
        check_representable(value)?;
        fields.insert(key.clone(), value.clone());
    }
    doc.insert("fields".into(), Value::Object(fields));

    doc.insert(
        "created_at".into(),
        Value::String(format_ts(&event.created_at)),
    );
    doc.insert(
        "received_at".into(),
        Value::String(format_ts(&event.received_at)),
    );

    doc.insert("previous_hash".into(), opt_string(&event.previous_hash));
    doc.insert("project_id".into(), Value::String(event.project_id.clone()));
    doc.insert(
        "environment_id".into(),
        Value::String(event.environment_id.clone()),
    );

    serde_json::to_vec(&Value::Object(doc))
        .map_err(|e| AthanorError::Validation(format!("event is not canonicalizable: {e}")))
}

fn opt_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn string_map(fields: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn actor_value(actor: Option<&Actor>) -> Value {
    match actor {
        None => Value::Null,
        Some(actor) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(actor.id.clone()));
            obj.insert("name".into(), opt_string(&actor.name));
            obj.insert("href".into(), opt_string(&actor.href));
            obj.insert("fields".into(), string_map(&actor.fields));
            Value::Object(obj)
        }
    }
}

fn target_value(target: Option<&Target>) -> Value {
    match target {
        None => Value::Null,
        Some(target) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(target.id.clone()));
            obj.insert("name".into(), opt_string(&target.name));
            obj.insert("href".into(), opt_string(&target.href));
            obj.insert("type".into(), opt_string(&target.kind));
            obj.insert("fields".into(), string_map(&target.fields));
            Value::Object(obj)
        }
    }
}

fn group_value(group: Option<&Group>) -> Value {
    match group {
        None => Value::Null,
        Some(group) => {
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(group.id.clone()));
            obj.insert("name".into(), opt_string(&group.name));
            Value::Object(obj)
        }
    }
}

/// `serde_json::Value` cannot hold a non-finite number, but payloads built
/// through other serializers can smuggle one in via a raw string; the only
/// remaining unrepresentable case is a number outside JSON's range after
/// arithmetic on `Number`. Walk the value and reject anything a strict
/// JSON emitter would choke on.
fn check_representable(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) => {
            if n.as_f64().map(|f| !f.is_finite()).unwrap_or(false) {
                return Err(AthanorError::Validation(
                    "non-finite number in event fields".into(),
                ));
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_representable),
        Value::Object(entries) => entries.values().try_for_each(check_representable),
        _ => Ok(()),
    }
}
