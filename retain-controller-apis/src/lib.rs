use std::{fmt, str::FromStr, time::Duration};

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{DateTime, SecondsFormat, Utc},
};
use kube::{core::GroupVersionKind, CustomResource};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "deckhouse.io";

/// Condition type reporting whether the retainer currently keeps its dependents alive.
pub const ACTIVE: &'static str = "Active";
/// Condition type reporting the TTL countdown after the followed object was lost.
pub const TTL_ACTIVE: &'static str = "TTLActive";

pub mod reasons {
    pub const MISSING_FOLLOW_OBJECT_REF: &'static str = "MissingFollowObjectRef";
    pub const MISSING_TTL: &'static str = "MissingTTL";
    pub const INVALID_TTL: &'static str = "InvalidTTL";
    pub const INVALID_API_VERSION: &'static str = "InvalidAPIVersion";
    pub const OBJECT_EXISTS: &'static str = "ObjectExists";
    pub const MISSING_FOLLOW_OBJECT: &'static str = "MissingFollowObject";
    pub const TTL_ACTIVE: &'static str = "TTLActive";
}

/// We maintain our own copy of Condition as the one from k8s_openapi does not implement JsonSchema.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct Condition {
    /// lastTransitionTime is the last time the condition transitioned from one status to another.
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// message is a human readable message indicating details about the transition. This may be an empty string.
    pub message: String,

    /// observedGeneration represents the .metadata.generation that the condition was set based upon.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// reason contains a programmatic identifier indicating the reason for the condition's last transition.
    pub reason: String,

    /// status of the condition, one of True, False, Unknown.
    pub status: String,

    /// type of condition in CamelCase.
    #[serde(rename = "type")]
    pub type_: String,
}

impl Condition {
    pub fn new(tpe: &str, status: Option<bool>, reason: &str, message: String) -> Self {
        Self {
            last_transition_time: None,
            message,
            reason: reason.to_string(),
            status: status
                .map(|v| if v { "True" } else { "False" })
                .unwrap_or("Unknown")
                .to_string(),
            type_: tpe.to_string(),
            observed_generation: None,
        }
    }

    pub fn with_observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Retention policy of a [`Retainer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetainMode {
    /// Retained until the referenced object is deleted.
    FollowObject,
    /// Retained for a fixed time after creation.
    Ttl,
    /// Retained until the referenced object is deleted, then kept for an additional TTL.
    FollowObjectWithTtl,
}

impl RetainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetainMode::FollowObject => "FollowObject",
            RetainMode::Ttl => "TTL",
            RetainMode::FollowObjectWithTtl => "FollowObjectWithTTL",
        }
    }

    /// Whether the mode observes the followed object and therefore cares about
    /// the deletion of the namespace it lives in.
    pub fn follows_object(&self) -> bool {
        matches!(self, RetainMode::FollowObject | RetainMode::FollowObjectWithTtl)
    }
}

impl fmt::Display for RetainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown retain mode {:?}", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for RetainMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FollowObject" => Ok(RetainMode::FollowObject),
            "TTL" => Ok(RetainMode::Ttl),
            "FollowObjectWithTTL" => Ok(RetainMode::FollowObjectWithTtl),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

fn mode_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::String.into()),
        enum_values: Some(
            [
                RetainMode::FollowObject,
                RetainMode::Ttl,
                RetainMode::FollowObjectWithTtl,
            ]
            .iter()
            .map(|m| serde_json::Value::String(m.as_str().to_string()))
            .collect(),
        ),
        ..Default::default()
    }
    .into()
}

/// Keeps the objects it owns alive for as long as its retention policy holds
/// and deletes itself afterwards, leaving the cleanup of its dependents to
/// the owner-reference garbage collector.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "Retainer",
    derive = "PartialEq",
    status = "RetainerStatus",
    printcolumn = r#"{
        "name":"Mode",
        "type": "string",
        "jsonPath": ".spec.mode",
        "description": "Retention policy of the Retainer."
    }"#,
    printcolumn = r#"{
        "name":"Phase",
        "type": "string",
        "jsonPath": ".status.phase",
        "description": "Current phase of the Retainer."
    }"#,
    printcolumn = r#"{
        "name":"Age",
        "type": "date",
        "jsonPath": ".metadata.creationTimestamp"
    }"#
)]
#[serde(rename_all = "camelCase")]
pub struct RetainerSpec {
    /// Retention policy, one of `FollowObject`, `TTL` or `FollowObjectWithTTL`.
    #[schemars(schema_with = "mode_schema")]
    pub mode: String,
    /// The object whose existence gates the retention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_object_ref: Option<FollowObjectRef>,
    /// Retention duration in Go duration syntax (e.g. `30m`, `24h`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl RetainerSpec {
    pub fn mode(&self) -> Result<RetainMode, UnknownMode> {
        self.mode.parse()
    }

    /// The parsed `ttl`, `None` if not set.
    pub fn ttl(&self) -> Option<Result<Duration, humantime::DurationError>> {
        self.ttl
            .as_deref()
            .map(|v| humantime::parse_duration(v.trim()))
    }
}

/// Strong reference to the followed object. The `uid` makes the reference
/// stable across delete/create cycles of objects with the same name.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowObjectRef {
    /// `group/version` or just `version` for the core API group.
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidApiVersion(pub String);

impl fmt::Display for InvalidApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid apiVersion {:?}", self.0)
    }
}

impl std::error::Error for InvalidApiVersion {}

impl FollowObjectRef {
    /// Split `apiVersion` into group and version and attach the kind.
    pub fn gvk(&self) -> Result<GroupVersionKind, InvalidApiVersion> {
        let invalid = || InvalidApiVersion(self.api_version.clone());
        let api_version = self.api_version.trim();
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        if version.is_empty() || version.contains('/') {
            return Err(invalid());
        }
        if group.is_empty() && api_version.contains('/') {
            return Err(invalid());
        }
        Ok(GroupVersionKind::gvk(group, version, self.kind.as_str()))
    }

    pub fn display_name(&self) -> String {
        format!("{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RetainerPhase {
    Pending,
    Tracking,
    #[serde(rename = "WaitingTTL")]
    WaitingTtl,
    /// Terminal, only observable right before the Retainer disappears.
    Expired,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetainerStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RetainerPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time the followed object was first observed missing, only used in
    /// `FollowObjectWithTTL` mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_at: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl RetainerStatus {
    pub fn condition(&self, tpe: &str) -> Option<&Condition> {
        self.conditions
            .as_ref()
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == tpe))
    }

    /// Set `c`: drop every condition of the same type, then append `c`.
    ///
    /// The previous `lastTransitionTime` survives if status and reason did not
    /// change, otherwise it becomes `now`.
    pub fn update_condition(&mut self, mut c: Condition, now: DateTime<Utc>) {
        let mut conditions: Vec<Condition> = self.conditions.take().unwrap_or_default();
        c.last_transition_time = match conditions.iter().find(|v| v.type_ == c.type_) {
            Some(existing) if existing.status == c.status && existing.reason == c.reason => {
                existing.last_transition_time.clone()
            }
            _ => None,
        }
        .or_else(|| Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)));
        conditions.retain(|v| v.type_ != c.type_);
        conditions.push(c);
        self.conditions = Some(conditions);
    }

    pub fn remove_condition(&mut self, tpe: &str) {
        if let Some(conditions) = self.conditions.as_mut() {
            conditions.retain(|c| c.type_ != tpe);
        }
    }
}

impl Retainer {
    pub fn id(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Namespace of the followed object, `None` if the Retainer does not
    /// reference an object in a namespace.
    pub fn followed_namespace(&self) -> Option<&str> {
        self.spec
            .follow_object_ref
            .as_ref()
            .map(|r| r.namespace.as_str())
            .filter(|ns| !ns.is_empty())
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
