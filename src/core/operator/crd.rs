//! Typed view of the ElastiService custom resource.
use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    core::names,
    ports::cluster::{ClusterError, ResourceKind},
};

pub const DEFAULT_COOLDOWN_PERIOD: Duration = Duration::from_secs(900);

fn default_min_target_replicas() -> i32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl ScaleTargetRef {
    pub fn is_complete(&self) -> bool {
        !self.api_version.is_empty() && !self.kind.is_empty() && !self.name.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTrigger {
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerRef {
    #[serde(rename = "type")]
    pub autoscaler_type: String,
    pub name: String,
}

impl AutoscalerRef {
    pub fn is_keda(&self) -> bool {
        self.autoscaler_type.eq_ignore_ascii_case("keda")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElastiServiceSpec {
    #[serde(default)]
    pub service: String,
    #[serde(default = "default_min_target_replicas")]
    pub min_target_replicas: i32,
    #[serde(default)]
    pub scale_target_ref: ScaleTargetRef,
    /// Seconds; 0 selects the default.
    #[serde(default)]
    pub cooldown_period: i32,
    #[serde(default)]
    pub triggers: Vec<ScaleTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaler: Option<AutoscalerRef>,
}

impl ElastiServiceSpec {
    pub fn cooldown(&self) -> Duration {
        if self.cooldown_period <= 0 {
            DEFAULT_COOLDOWN_PERIOD
        } else {
            Duration::from_secs(self.cooldown_period as u64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElastiServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scaled_up_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: String,
}

impl ElastiServiceStatus {
    pub fn mode(&self) -> Option<Mode> {
        self.mode.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElastiService {
    pub metadata: ObjectMeta,
    pub spec: ElastiServiceSpec,
    #[serde(default)]
    pub status: ElastiServiceStatus,
}

impl ElastiService {
    pub fn from_value(value: Value) -> Result<Self, ClusterError> {
        serde_json::from_value(value)
            .map_err(|e| ClusterError::Invalid(format!("malformed ElastiService: {e}")))
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name` of the resource itself.
    pub fn key(&self) -> String {
        names::namespaced_key(self.namespace(), self.name())
    }

    /// `namespace/service` of the public service it manages.
    pub fn service_key(&self) -> String {
        names::namespaced_key(self.namespace(), &self.spec.service)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == names::FINALIZER)
    }
}

/// How traffic for a managed service is currently routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Public service endpoints point at the resolver
    Proxy,
    /// Public service routes straight to the workload
    Serve,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Serve => "serve",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(Self::Proxy),
            "serve" => Ok(Self::Serve),
            other => Err(ClusterError::Invalid(format!("unknown mode: {other}"))),
        }
    }
}

/// Workload kinds a scale target may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTargetKind {
    Deployment,
    Rollout,
}

impl ScaleTargetKind {
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::Deployment => ResourceKind::Deployment,
            Self::Rollout => ResourceKind::Rollout,
        }
    }
}

impl FromStr for ScaleTargetKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployments" | "deployment" => Ok(Self::Deployment),
            "rollouts" | "rollout" => Ok(Self::Rollout),
            other => Err(ClusterError::Invalid(format!(
                "unsupported target kind: {other}"
            ))),
        }
    }
}
