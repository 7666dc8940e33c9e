/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sriov_inventory::{DEFAULT_ADDRESS, DEFAULT_PORT, NodeInventory};

/// Where per-interface state is kept between ADD and DEL
pub const DEFAULT_CNI_DIR: &str = "/var/lib/cni/sriov";

const DEFAULT_KUBECONFIG: &str = "/etc/kubernetes/kubelet.conf";
const DEFAULT_SYSFS_ROOT: &str = "/sys";
const DEFAULT_INVENTORY_TIMEOUT_MS: u64 = 1500;
const MAX_VLAN: u16 = 4094;

/// Interface names the runtime owns inside the pod.
const RESERVED_IF_NAMES: [&str; 3] = ["eth0", "eth1", "lo"];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid network configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("if0name '{0}' is reserved and cannot be used")]
    ReservedIfName(String),
    #[error("Either if0 or pfNetdevices must be set")]
    MissingPf,
    #[error("VLAN {0} is outside 0..={MAX_VLAN}")]
    InvalidVlan(u16),
    #[error("dpdk requires kernel_driver, dpdk_driver and dpdk_tool to all be set")]
    IncompleteDpdk,
    #[error("CNI_ARGS entry '{0}' is not of the form KEY=VALUE")]
    MalformedArgs(String),
    #[error("CNI_ARGS does not name the pod (K8S_POD_NAMESPACE and K8S_POD_NAME)")]
    MissingPodRef,
}

/// Network configuration handed to the plugin on stdin.
///
/// We only implement Serialize for unit tests and for the delegated IPAM
/// plugin, which receives the original bytes anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub ipam: IpamConf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<serde_json::Value>,
    #[serde(default)]
    pub dpdk: DpdkConf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_dir: Option<PathBuf>,
    #[serde(default)]
    pub if0: String,
    #[serde(default, rename = "if0name", skip_serializing_if = "Option::is_none")]
    pub if0_name: Option<String>,
    #[serde(default, rename = "l2enable")]
    pub l2_enable: bool,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub pf_netdevices: Vec<String>,
    #[serde(default)]
    pub legacy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub inventory: InventoryConf,
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

impl NetConf {
    /// Parses and validates the stdin document. Nothing on the host has been
    /// touched when this fails.
    pub fn parse(data: &[u8]) -> Result<Self, ConfigError> {
        let conf: NetConf = serde_json::from_slice(data)?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.if0_name
            && (name.is_empty() || RESERVED_IF_NAMES.contains(&name.as_str()))
        {
            return Err(ConfigError::ReservedIfName(name.clone()));
        }
        if self.if0.is_empty() && self.pf_netdevices.is_empty() {
            return Err(ConfigError::MissingPf);
        }
        if self.vlan > MAX_VLAN {
            return Err(ConfigError::InvalidVlan(self.vlan));
        }
        if self.dpdk.is_requested() && !self.dpdk.is_complete() {
            return Err(ConfigError::IncompleteDpdk);
        }
        Ok(())
    }

    pub fn dpdk_mode(&self) -> bool {
        self.dpdk.is_requested()
    }

    /// True when IP configuration is left to someone else.
    pub fn skips_ipam(&self) -> bool {
        self.dpdk_mode() || self.l2_enable
    }

    pub fn scratch_dir(&self) -> &Path {
        self.cni_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CNI_DIR))
    }

    /// `if0` followed by `pfNetdevices`, without duplicates.
    pub fn pf_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::new();
        for pf in std::iter::once(&self.if0).chain(self.pf_netdevices.iter()) {
            if !pf.is_empty() && !candidates.contains(pf) {
                candidates.push(pf.clone());
            }
        }
        candidates
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConf {
    #[serde(default, rename = "type")]
    pub ipam_type: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpdkConf {
    #[serde(default)]
    pub kernel_driver: String,
    #[serde(default)]
    pub dpdk_driver: String,
    #[serde(default)]
    pub dpdk_tool: String,
}

impl DpdkConf {
    pub fn is_requested(&self) -> bool {
        !self.kernel_driver.is_empty() || !self.dpdk_driver.is_empty() || !self.dpdk_tool.is_empty()
    }

    fn is_complete(&self) -> bool {
        !self.kernel_driver.is_empty() && !self.dpdk_driver.is_empty() && !self.dpdk_tool.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryConf {
    #[serde(default = "default_inventory_address")]
    pub address: String,
    #[serde(default = "default_inventory_port")]
    pub port: u16,
    #[serde(default = "default_inventory_timeout_ms")]
    pub timeout_ms: u64,
}

// Called if no `inventory` is provided at all.
// The serde defaults above are called if one or more fields are missing.
impl Default for InventoryConf {
    fn default() -> Self {
        Self {
            address: default_inventory_address(),
            port: default_inventory_port(),
            timeout_ms: default_inventory_timeout_ms(),
        }
    }
}

impl InventoryConf {
    pub fn node_inventory(&self) -> NodeInventory {
        NodeInventory::new(
            self.address.clone(),
            self.port,
            Duration::from_millis(self.timeout_ms),
        )
    }
}

pub fn default_inventory_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

pub fn default_inventory_port() -> u16 {
    DEFAULT_PORT
}

pub fn default_inventory_timeout_ms() -> u64 {
    DEFAULT_INVENTORY_TIMEOUT_MS
}

pub fn default_kubeconfig() -> PathBuf {
    PathBuf::from(DEFAULT_KUBECONFIG)
}

pub fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

/// The pod an invocation is acting for, taken from `CNI_ARGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn from_cni_args(args: &str) -> Result<Self, ConfigError> {
        let mut args = parse_cni_args(args)?;
        match (args.remove("K8S_POD_NAMESPACE"), args.remove("K8S_POD_NAME")) {
            (Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self { namespace, name })
            }
            _ => Err(ConfigError::MissingPodRef),
        }
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Splits `K1=V1;K2=V2` into a map.
pub fn parse_cni_args(args: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    args.split(';')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| ConfigError::MalformedArgs(pair.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let conf = NetConf::parse(
            br#"{
                "cniVersion": "0.3.1",
                "name": "rdma-net",
                "type": "rdma-sriov",
                "if0": "ens1f0",
                "if0name": "net0",
                "l2enable": false,
                "vlan": 100,
                "pfNetdevices": ["ens1f1", "ens1f0"],
                "cniDir": "/run/sriov",
                "ipam": { "type": "host-local", "subnet": "10.55.206.0/26" },
                "dns": { "nameservers": ["10.0.0.10"] },
                "inventory": { "port": 6000 }
            }"#,
        )
        .unwrap();

        assert_eq!(conf.if0_name.as_deref(), Some("net0"));
        assert_eq!(conf.vlan, 100);
        assert_eq!(conf.scratch_dir(), Path::new("/run/sriov"));
        assert_eq!(conf.ipam.ipam_type, "host-local");
        assert_eq!(conf.ipam.options["subnet"], "10.55.206.0/26");
        assert_eq!(conf.pf_candidates(), vec!["ens1f0", "ens1f1"]);
        assert!(!conf.dpdk_mode());
        assert!(!conf.skips_ipam());
        assert_eq!(conf.inventory.port, 6000);
        assert_eq!(conf.inventory.address, "127.0.0.1");
        assert_eq!(
            conf.inventory.node_inventory().timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(conf.kubeconfig, PathBuf::from("/etc/kubernetes/kubelet.conf"));
    }

    #[test]
    fn test_defaults() {
        let conf = NetConf::parse(br#"{"if0": "ens1f0"}"#).unwrap();
        assert_eq!(conf.scratch_dir(), Path::new(DEFAULT_CNI_DIR));
        assert_eq!(conf.sysfs_root, PathBuf::from("/sys"));
        assert_eq!(conf.inventory, InventoryConf::default());
        assert!(conf.if0_name.is_none());
        assert!(!conf.legacy);
    }

    #[test]
    fn test_reserved_if_names_rejected() {
        for name in ["eth0", "eth1", "lo", ""] {
            let doc = format!(r#"{{"if0": "ens1f0", "if0name": "{name}"}}"#);
            let err = NetConf::parse(doc.as_bytes()).unwrap_err();
            assert!(matches!(err, ConfigError::ReservedIfName(n) if n == name));
        }
    }

    #[test]
    fn test_pf_required() {
        assert!(matches!(
            NetConf::parse(br#"{"name": "x"}"#).unwrap_err(),
            ConfigError::MissingPf
        ));
        assert!(NetConf::parse(br#"{"pfNetdevices": ["ens1f1"]}"#).is_ok());
    }

    #[test]
    fn test_vlan_range() {
        assert!(matches!(
            NetConf::parse(br#"{"if0": "p", "vlan": 4095}"#).unwrap_err(),
            ConfigError::InvalidVlan(4095)
        ));
        // Out of u16 range is a parse failure.
        assert!(matches!(
            NetConf::parse(br#"{"if0": "p", "vlan": 70000}"#).unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_dpdk_mode() {
        let conf = NetConf::parse(
            br#"{"if0": "p", "dpdk": {"kernel_driver": "mlx5_core", "dpdk_driver": "vfio-pci", "dpdk_tool": "/opt/dpdk/dpdk-devbind.py"}}"#,
        )
        .unwrap();
        assert!(conf.dpdk_mode());
        assert!(conf.skips_ipam());

        let err =
            NetConf::parse(br#"{"if0": "p", "dpdk": {"dpdk_driver": "vfio-pci"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteDpdk));

        let conf = NetConf::parse(br#"{"if0": "p", "dpdk": {}}"#).unwrap();
        assert!(!conf.dpdk_mode());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            NetConf::parse(b"{not json").unwrap_err(),
            ConfigError::Parse(_)
        ));
    }

    #[test]
    fn test_pod_ref_from_cni_args() {
        let pod = PodRef::from_cni_args(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=trainer-0;K8S_POD_INFRA_CONTAINER_ID=abc",
        )
        .unwrap();
        assert_eq!(pod.namespace, "team-a");
        assert_eq!(pod.name, "trainer-0");
        assert_eq!(pod.to_string(), "team-a/trainer-0");

        assert!(matches!(
            PodRef::from_cni_args("K8S_POD_NAME=x").unwrap_err(),
            ConfigError::MissingPodRef
        ));
        assert!(matches!(
            PodRef::from_cni_args("K8S_POD_NAME").unwrap_err(),
            ConfigError::MalformedArgs(_)
        ));
        assert!(parse_cni_args("").unwrap().is_empty());
    }
}
