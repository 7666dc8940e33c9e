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

//! Delegation of IP address management to a separate CNI IPAM plugin, and
//! application of its result to the pod interface.

use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::cmd::{Cmd, CmdError};
use crate::error::SriovError;
use crate::host::Host;

#[derive(thiserror::Error, Debug)]
pub enum IpamError {
    #[error("IPAM plugin '{0}' not found in {1:?}")]
    PluginNotFound(String, Vec<PathBuf>),
    #[error("IPAM plugin '{plugin}' {command} failed: {source}")]
    Exec {
        plugin: String,
        command: &'static str,
        #[source]
        source: CmdError,
    },
    #[error("IPAM plugin '{0}' returned an unparseable result: {1}")]
    Result(String, #[source] serde_json::Error),
    #[error("Applying IPAM result to {if_name} failed: {source}")]
    Apply {
        if_name: String,
        #[source]
        source: SriovError,
    },
}

/// Runs the IPAM plugin named by the network config.
#[cfg_attr(test, mockall::automock)]
pub trait IpamDelegate {
    fn add(&self, ipam_type: &str, if_name: &str, config: &[u8]) -> Result<IpamResult, IpamError>;
    fn del(&self, ipam_type: &str, if_name: &str, config: &[u8]) -> Result<(), IpamError>;
}

/// Executes IPAM plugin binaries found on the CNI plugin path. The rest of
/// the `CNI_*` environment is inherited from our own invocation.
#[derive(Debug, Clone)]
pub struct ExecIpam {
    plugin_dirs: Vec<PathBuf>,
}

impl ExecIpam {
    pub fn new(plugin_dirs: Vec<PathBuf>) -> Self {
        Self { plugin_dirs }
    }

    fn find_plugin(&self, ipam_type: &str) -> Result<PathBuf, IpamError> {
        self.plugin_dirs
            .iter()
            .map(|dir| dir.join(ipam_type))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| IpamError::PluginNotFound(ipam_type.to_string(), self.plugin_dirs.clone()))
    }

    fn run(
        &self,
        ipam_type: &str,
        command: &'static str,
        if_name: &str,
        config: &[u8],
    ) -> Result<String, IpamError> {
        let plugin = self.find_plugin(ipam_type)?;
        Cmd::new(&plugin)
            .env("CNI_COMMAND", command)
            .env("CNI_IFNAME", if_name)
            .stdin(config)
            .output()
            .map_err(|source| IpamError::Exec {
                plugin: ipam_type.to_string(),
                command,
                source,
            })
    }
}

impl IpamDelegate for ExecIpam {
    fn add(&self, ipam_type: &str, if_name: &str, config: &[u8]) -> Result<IpamResult, IpamError> {
        let stdout = self.run(ipam_type, "ADD", if_name, config)?;
        serde_json::from_str(&stdout).map_err(|e| IpamError::Result(ipam_type.to_string(), e))
    }

    fn del(&self, ipam_type: &str, if_name: &str, config: &[u8]) -> Result<(), IpamError> {
        self.run(ipam_type, "DEL", if_name, config).map(|_| ())
    }
}

/// A CNI result document. Reads both the current `ips`/`routes` layout and
/// the 0.2 `ip4`/`ip6` layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamResult {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<ResultInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<IpConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<LegacyIpConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<LegacyIpConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub address: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub dst: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyIpConfig {
    pub ip: IpNetwork,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

impl IpamResult {
    /// Addresses from either result layout.
    pub fn addresses(&self) -> Vec<IpConfig> {
        let legacy = [&self.ip4, &self.ip6]
            .into_iter()
            .flatten()
            .map(|legacy| IpConfig {
                address: legacy.ip,
                gateway: legacy.gateway,
                interface: None,
            });
        self.ips.iter().cloned().chain(legacy).collect()
    }

    /// Routes from either result layout, with a missing next hop filled in
    /// from the gateway of an address in the same family.
    pub fn resolved_routes(&self) -> Vec<RouteConfig> {
        let addresses = self.addresses();
        let legacy = [&self.ip4, &self.ip6]
            .into_iter()
            .flatten()
            .flat_map(|legacy| legacy.routes.iter());
        self.routes
            .iter()
            .chain(legacy)
            .map(|route| RouteConfig {
                dst: route.dst,
                gw: route.gw.or_else(|| {
                    addresses
                        .iter()
                        .filter_map(|address| address.gateway)
                        .find(|gateway| gateway.is_ipv4() == route.dst.is_ipv4())
                }),
            })
            .collect()
    }

    /// Configures addresses and routes on the link named `if_name` in the
    /// namespace `host` is currently in.
    pub fn apply<H: Host + ?Sized>(&self, host: &H, if_name: &str) -> Result<(), IpamError> {
        let apply_err = |source| IpamError::Apply {
            if_name: if_name.to_string(),
            source,
        };
        let link = host
            .link_by_name(if_name)
            .map_err(apply_err)?
            .ok_or_else(|| {
                apply_err(SriovError::LinkNotFound {
                    name: if_name.to_string(),
                })
            })?;

        for address in self.addresses() {
            host.add_address(link.index, address.address)
                .map_err(apply_err)?;
        }
        for route in self.resolved_routes() {
            host.add_route(link.index, route.dst, route.gw)
                .map_err(apply_err)?;
        }
        tracing::debug!(if_name, "Applied IPAM result");
        Ok(())
    }
}
