//! Event types: the client-supplied submission and the committed row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AthanorError;

/// CRUD classification of an audit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crud {
    Create,
    Read,
    Update,
    Delete,
}

impl Crud {
    pub fn as_str(&self) -> &'static str {
        match self {
            Crud::Create => "create",
            Crud::Read => "read",
            Crud::Update => "update",
            Crud::Delete => "delete",
        }
    }
}

impl Default for Crud {
    fn default() -> Self {
        Crud::Create
    }
}

impl FromStr for Crud {
    type Err = AthanorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Crud::Create),
            "read" => Ok(Crud::Read),
            "update" => Ok(Crud::Update),
            "delete" => Ok(Crud::Delete),
            other => Err(AthanorError::Validation(format!(
                "crud must be one of create/read/update/delete, got '{other}'"
            ))),
        }
    }
}

/// The entity that performed the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The entity the action was performed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Target {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Optional grouping of related events (e.g. a customer organization).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A client submission, before the server assigns identity, timestamps,
/// chain links, and a signature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub external_id: Option<String>,

    pub action: String,
    pub crud: Crud,

    #[serde(default)]
    pub actor: Option<Actor>,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub group: Option<Group>,

    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub is_failure: bool,

    /// Free-form event payload, covered by the signature.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,

    /// Internal annotations; opaque to the chain and excluded from the
    /// canonical form.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Event time as observed by the client. Defaults to the server's
    /// receive time; may precede it when clients backfill.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(action: impl Into<String>, crud: Crud) -> Self {
        Self {
            action: action.into(),
            crud,
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// A committed, immutable audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub external_id: Option<String>,

    pub action: String,
    pub crud: Crud,

    pub actor: Option<Actor>,
    pub target: Option<Target>,
    pub group: Option<Group>,

    pub description: Option<String>,
    pub component: Option<String>,
    pub version: Option<String>,
    pub source_ip: Option<String>,
    pub is_anonymous: bool,
    pub is_failure: bool,

    pub fields: BTreeMap<String, serde_json::Value>,
    pub metadata: BTreeMap<String, String>,

    /// Event time supplied by the client (advisory).
    pub created_at: DateTime<Utc>,
    /// Authoritative server time at ingest; chain order follows this.
    pub received_at: DateTime<Utc>,

    /// Lowercase hex digest of the canonical form.
    pub hash: String,
    /// Hash of the prior event in the stream; `None` only at genesis.
    pub previous_hash: Option<String>,
    /// Base64 signature over the canonical form.
    pub signature: String,

    pub project_id: String,
    pub environment_id: String,
}

impl AuditEvent {
    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }
}

/// Latest link of a stream's chain, read under the stream lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: String,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_parses_and_rejects() {
        assert_eq!(Crud::from_str("update").unwrap(), Crud::Update);
        assert_eq!(Crud::Create.as_str(), "create");
        assert!(Crud::from_str("upsert").is_err());
    }

    #[test]
    fn crud_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Crud::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn target_type_uses_wire_name() {
        let target = Target::new("u1").with_kind("user");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["type"], "user");
    }

    #[test]
    fn new_event_round_trips_through_json() {
        let event = NewEvent::new("user.create", Crud::Create)
            .with_actor(Actor::new("u1").with_name("Alice"))
            .with_field("plan", serde_json::json!("pro"));
        let json = serde_json::to_string(&event).unwrap();
        let back: NewEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.action, "user.create");
        assert_eq!(back.actor.unwrap().name.as_deref(), Some("Alice"));
        assert_eq!(back.fields["plan"], serde_json::json!("pro"));
    }
}
