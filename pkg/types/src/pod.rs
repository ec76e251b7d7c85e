use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::net::Protocol;
use crate::resource::Resource;

// --- Container spec ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub host_network: bool,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

// --- Pod status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Container-level termination reason surfaced on the pod status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerReason {
    Completed,
    CrashLoopBackOff,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub reason: Option<ContainerReason>,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub host_ip: Option<String>,
}

// --- Persisted Pod object ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Absent until the pod network has been wired up.
    #[serde(default)]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.status.pod_ip.as_deref()?.parse().ok()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
            || self.status.reason == Some(ContainerReason::Completed)
    }

    /// Resolve a named container port, optionally restricted to one protocol.
    pub fn container_port(&self, name: &str, protocol: Option<Protocol>) -> Option<u16> {
        self.spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .find(|p| {
                p.name.as_deref() == Some(name) && protocol.is_none_or(|proto| proto == p.protocol)
            })
            .map(|p| p.container_port)
    }

    fn has_annotations(&self) -> bool {
        self.annotations.as_ref().is_some_and(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodTransition {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
    Completed,
    CrashLoopBackOff,
    AnnotationsAdded,
}

impl From<PodPhase> for PodTransition {
    fn from(phase: PodPhase) -> Self {
        match phase {
            PodPhase::Pending => PodTransition::Pending,
            PodPhase::Running => PodTransition::Running,
            PodPhase::Succeeded => PodTransition::Succeeded,
            PodPhase::Failed => PodTransition::Failed,
            PodPhase::Unknown => PodTransition::Unknown,
        }
    }
}

impl Resource for Pod {
    type Transition = PodTransition;
    const KIND: &'static str = "pods";

    fn uid(&self) -> &str {
        &self.id
    }

    fn transitions(old: &Self, new: &Self) -> Vec<PodTransition> {
        let mut out = Vec::new();
        if old.status.phase != new.status.phase {
            out.push(new.status.phase.into());
        }
        if old.status.reason != new.status.reason {
            match new.status.reason {
                Some(ContainerReason::Completed) => out.push(PodTransition::Completed),
                Some(ContainerReason::CrashLoopBackOff) => {
                    out.push(PodTransition::CrashLoopBackOff)
                }
                None => {}
            }
        }
        if !old.has_annotations() && new.has_annotations() {
            out.push(PodTransition::AnnotationsAdded);
        }
        out
    }
}
