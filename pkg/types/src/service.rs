use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use pkg_constants::network::CLUSTER_IP_NONE;

use crate::net::{IntOrString, Protocol};
use crate::resource::{NoTransition, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
            ServiceType::ExternalName => write!(f, "ExternalName"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    pub port: u16,
    /// Defaults to `port` when absent.
    #[serde(default)]
    pub target_port: Option<IntOrString>,
    #[serde(default)]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub service_type: ServiceType,
    /// `"None"` marks a headless service.
    #[serde(default)]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub spec: ServiceSpec,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Service {
    /// The virtual IP, if the service has a usable one.
    pub fn cluster_ipv4(&self) -> Option<Ipv4Addr> {
        match self.spec.cluster_ip.as_deref() {
            None | Some("") | Some(CLUSTER_IP_NONE) => None,
            Some(ip) => ip.parse().ok(),
        }
    }
}

impl Resource for Service {
    type Transition = NoTransition;
    const KIND: &'static str = "services";

    fn uid(&self) -> &str {
        &self.id
    }
}
