use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::net::Protocol;
use crate::resource::{NoTransition, Resource};

/// An address of a backend pod serving a Service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub pod_id: Option<String>,
}

/// A port exposed by a backend pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

/// The set of backend addresses for a Service. Shares the Service's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Endpoints {
    /// All (ip, port) backends for the port with the given name and protocol.
    ///
    /// A `None` name matches unnamed ports; a single-port subset matches any name.
    pub fn backends(&self, port_name: Option<&str>, protocol: Protocol) -> Vec<(Ipv4Addr, u16)> {
        let mut out = Vec::new();
        for subset in &self.subsets {
            let port = subset.ports.iter().find(|p| {
                p.protocol == protocol
                    && (p.name.as_deref() == port_name || subset.ports.len() == 1)
            });
            let Some(port) = port else { continue };
            for addr in &subset.addresses {
                if let Ok(ip) = addr.ip.parse::<Ipv4Addr>() {
                    out.push((ip, port.port));
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }
}

impl Resource for Endpoints {
    type Transition = NoTransition;
    const KIND: &'static str = "endpoints";

    fn uid(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_by_port_name() {
        let ep = Endpoints {
            id: "e1".to_string(),
            name: "web".to_string(),
            namespace: "default".to_string(),
            subsets: vec![EndpointSubset {
                addresses: vec![
                    EndpointAddress { ip: "10.10.1.6".to_string(), node_name: None, pod_id: None },
                    EndpointAddress { ip: "10.10.1.5".to_string(), node_name: None, pod_id: None },
                ],
                ports: vec![
                    EndpointPort { name: Some("http".to_string()), port: 8080, protocol: Protocol::Tcp },
                    EndpointPort { name: Some("metrics".to_string()), port: 9090, protocol: Protocol::Tcp },
                ],
            }],
            created_at: Utc::now(),
        };
        assert_eq!(
            ep.backends(Some("http"), Protocol::Tcp),
            vec![
                (Ipv4Addr::new(10, 10, 1, 5), 8080),
                (Ipv4Addr::new(10, 10, 1, 6), 8080)
            ]
        );
        assert!(ep.backends(Some("http"), Protocol::Udp).is_empty());
    }
}
