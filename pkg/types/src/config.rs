use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use pkg_constants::network::*;

use crate::net::MacAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatMode {
    Stateful,
    #[default]
    Stateless,
}

impl FromStr for NatMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stateful" => Ok(NatMode::Stateful),
            "stateless" => Ok(NatMode::Stateless),
            other => Err(anyhow::anyhow!("unknown NAT mode: {}", other)),
        }
    }
}

impl std::fmt::Display for NatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatMode::Stateful => write!(f, "stateful"),
            NatMode::Stateless => write!(f, "stateless"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArpMode {
    #[default]
    Proxy,
    Broadcast,
}

impl FromStr for ArpMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "proxy" => Ok(ArpMode::Proxy),
            "broadcast" => Ok(ArpMode::Broadcast),
            other => Err(anyhow::anyhow!("unknown ARP mode: {}", other)),
        }
    }
}

impl std::fmt::Display for ArpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArpMode::Proxy => write!(f, "proxy"),
            ArpMode::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Process-wide networking settings. Held as an immutable snapshot and
/// replaced wholesale on reconfiguration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    pub nat_mode: NatMode,
    pub arp_mode: ArpMode,
    pub gateway_mac: MacAddr,
    pub service_cidr: Ipv4Net,
    /// Cluster /16 that every node network is carved from.
    pub pod_cidr: Ipv4Net,
    /// Shadow /16 used by stateless NAT.
    pub shifted_cidr: Ipv4Net,
    pub stateful_nat_idle_timeout_secs: u64,
    pub arp_retry_interval_ms: u64,
    pub arp_max_retries: u32,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            nat_mode: NatMode::default(),
            arp_mode: ArpMode::default(),
            gateway_mac: MacAddr([0xfe, 0x00, 0x00, 0x00, 0x00, 0x20]),
            service_cidr: Ipv4Net::new(std::net::Ipv4Addr::new(10, 96, 0, 0), 12)
                .unwrap_or_default(),
            pod_cidr: Ipv4Net::new(std::net::Ipv4Addr::new(10, 10, 0, 0), 16).unwrap_or_default(),
            shifted_cidr: Ipv4Net::new(std::net::Ipv4Addr::new(172, 10, 0, 0), 16)
                .unwrap_or_default(),
            stateful_nat_idle_timeout_secs: DEFAULT_STATEFUL_NAT_IDLE_TIMEOUT_SECS,
            arp_retry_interval_ms: DEFAULT_ARP_RETRY_INTERVAL_MS,
            arp_max_retries: DEFAULT_ARP_MAX_RETRIES,
        }
    }
}

impl NetworkingConfig {
    /// Overlay the values set in a config file onto the defaults.
    pub fn from_file(file: &NetworkingConfigFile) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(mode) = &file.nat_mode {
            cfg.nat_mode = mode.parse()?;
        }
        if let Some(mode) = &file.arp_mode {
            cfg.arp_mode = mode.parse()?;
        }
        if let Some(mac) = &file.gateway_mac {
            cfg.gateway_mac = mac
                .parse()
                .map_err(|e| anyhow::anyhow!("gateway-mac: {}", e))?;
        }
        if let Some(cidr) = &file.service_cidr {
            cfg.service_cidr = parse_cidr("service-cidr", cidr)?;
        }
        if let Some(cidr) = &file.pod_cidr {
            cfg.pod_cidr = parse_cidr("pod-cidr", cidr)?;
        }
        if let Some(cidr) = &file.shifted_cidr {
            cfg.shifted_cidr = parse_cidr("shifted-cidr", cidr)?;
        }
        if let Some(secs) = file.stateful_nat_idle_timeout_secs {
            cfg.stateful_nat_idle_timeout_secs = secs;
        }
        if let Some(ms) = file.arp_retry_interval_ms {
            cfg.arp_retry_interval_ms = ms;
        }
        if let Some(n) = file.arp_max_retries {
            cfg.arp_max_retries = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pod_cidr.prefix_len() != 16 || self.shifted_cidr.prefix_len() != 16 {
            return Err(anyhow::anyhow!(
                "pod-cidr and shifted-cidr must be /16 networks (got {} and {})",
                self.pod_cidr,
                self.shifted_cidr
            ));
        }
        if self.pod_cidr.contains(&self.service_cidr.network())
            || self.service_cidr.contains(&self.pod_cidr.network())
        {
            return Err(anyhow::anyhow!(
                "service-cidr {} overlaps pod-cidr {}",
                self.service_cidr,
                self.pod_cidr
            ));
        }
        Ok(())
    }
}

fn parse_cidr(field: &str, value: &str) -> anyhow::Result<Ipv4Net> {
    value
        .parse::<Ipv4Net>()
        .map(|n| n.trunc())
        .map_err(|e| anyhow::anyhow!("{}: invalid CIDR {}: {}", field, value, e))
}

/// `networking:` section of the controller config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkingConfigFile {
    #[serde(default, alias = "nat-mode")]
    pub nat_mode: Option<String>,
    #[serde(default, alias = "arp-mode")]
    pub arp_mode: Option<String>,
    #[serde(default, alias = "gateway-mac")]
    pub gateway_mac: Option<String>,
    #[serde(default, alias = "service-cidr")]
    pub service_cidr: Option<String>,
    #[serde(default, alias = "pod-cidr")]
    pub pod_cidr: Option<String>,
    #[serde(default, alias = "shifted-cidr")]
    pub shifted_cidr: Option<String>,
    #[serde(default, alias = "stateful-nat-idle-timeout-secs")]
    pub stateful_nat_idle_timeout_secs: Option<u64>,
    #[serde(default, alias = "arp-retry-interval-ms")]
    pub arp_retry_interval_ms: Option<u64>,
    #[serde(default, alias = "arp-max-retries")]
    pub arp_max_retries: Option<u32>,
}

/// Controller configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 6543
/// data-dir: /var/lib/k8snet
/// node-name: master-1
/// networking:
///   nat-mode: stateful
///   gateway-mac: fe:00:00:00:00:20
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "node-name")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub ephemeral: Option<bool>,
    #[serde(default)]
    pub networking: NetworkingConfigFile,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = NetworkingConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.service_cidr.to_string(), DEFAULT_SERVICE_CIDR);
        assert_eq!(cfg.pod_cidr.to_string(), DEFAULT_POD_CIDR);
        assert_eq!(cfg.shifted_cidr.to_string(), DEFAULT_SHIFTED_CIDR);
        assert_eq!(cfg.gateway_mac.to_string(), DEFAULT_GATEWAY_MAC);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let yaml = r#"
port: 7000
data-dir: /var/lib/k8snet
networking:
  nat-mode: stateful
  arp-mode: broadcast
  stateful-nat-idle-timeout-secs: 30
"#;
        let file: ControllerConfigFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.port, Some(7000));
        let cfg = NetworkingConfig::from_file(&file.networking).unwrap();
        assert_eq!(cfg.nat_mode, NatMode::Stateful);
        assert_eq!(cfg.arp_mode, ArpMode::Broadcast);
        assert_eq!(cfg.stateful_nat_idle_timeout_secs, 30);
        assert_eq!(cfg.arp_max_retries, DEFAULT_ARP_MAX_RETRIES);
    }

    #[test]
    fn rejects_bad_values() {
        let file = NetworkingConfigFile {
            nat_mode: Some("sometimes".to_string()),
            ..Default::default()
        };
        assert!(NetworkingConfig::from_file(&file).is_err());

        let file = NetworkingConfigFile {
            pod_cidr: Some("10.10.0.0/24".to_string()),
            ..Default::default()
        };
        assert!(NetworkingConfig::from_file(&file).is_err());
    }

    #[test]
    fn missing_file_gives_default() {
        let cfg: ControllerConfigFile =
            load_config_file("/nonexistent/k8snet/config.yaml").unwrap();
        assert!(cfg.port.is_none());
    }
}
