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

//! Attach and detach of all VF interfaces of one pod.

use serde::Serialize;
use sriov_inventory::{
    InterfaceRequest, InventoryError, NodeInventory, PhysicalFunction,
    find_vf_by_hardware_address,
};
use sriov_placement::{PlacementError, place, sort_by_free_vfs};

use crate::command_line::Options;
use crate::config::{ConfigError, NetConf, PodRef};
use crate::error::SriovError;
use crate::host::{Host, LinkInfo, with_netns};
use crate::ipam::{IpamDelegate, IpamError, IpamResult, ResultInterface};
use crate::metadata::{MetadataError, WorkloadMetadata};
use crate::netns::NetNs;
use crate::store::{PersistedInterfaceConfig, ScratchStore};
use crate::sysfs::Sysfs;
use crate::vf::{SetupFailure, VfManager, VfSetup, VfState};

/// CNI versions whose result documents this plugin can produce.
pub const SUPPORTED_VERSIONS: [&str; 4] = ["0.1.0", "0.2.0", "0.3.0", "0.3.1"];

/// The result printed for a successful ADD. Same document an IPAM plugin
/// returns, plus the pod interfaces.
pub type CniResult = IpamResult;

/// Source of the node's PF inventory.
#[cfg_attr(test, mockall::automock)]
pub trait InventorySource {
    fn physical_functions(&self) -> Result<Vec<PhysicalFunction>, InventoryError>;
}

impl InventorySource for NodeInventory {
    fn physical_functions(&self) -> Result<Vec<PhysicalFunction>, InventoryError> {
        self.query()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("CNI_NETNS is required for ADD")]
    MissingNetns,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error(transparent)]
    Sriov(#[from] SriovError),
    #[error(transparent)]
    Setup(#[from] SetupFailure),
    #[error(transparent)]
    Ipam(#[from] IpamError),
}

impl PluginError {
    /// Error code of the CNI error document.
    pub fn cni_code(&self) -> u32 {
        match self {
            PluginError::Config(ConfigError::MalformedArgs(_) | ConfigError::MissingPodRef) => 7,
            PluginError::Config(_) => 4,
            PluginError::MissingNetns => 7,
            PluginError::Placement(_) => 11,
            _ => 999,
        }
    }
}

/// CNI error document, printed on stdout when a command fails.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorReport {
    pub fn new(cni_version: &str, code: u32, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            cni_version: cni_version.to_string(),
            code,
            msg: error.to_string(),
            details: causes.join(": "),
        }
    }

    pub fn from_plugin_error(cni_version: &str, error: &PluginError) -> Self {
        Self::new(cni_version, error.cni_code(), error)
    }
}

/// Answer to the VERSION command.
pub fn version_info(cni_version: &str) -> serde_json::Value {
    serde_json::json!({
        "cniVersion": cni_version,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

pub struct Plugin<'a> {
    conf: &'a NetConf,
    raw_conf: &'a [u8],
    host: &'a dyn Host,
    sysfs: Sysfs,
    store: ScratchStore,
    inventory: &'a dyn InventorySource,
    metadata: &'a dyn WorkloadMetadata,
    ipam: &'a dyn IpamDelegate,
}

impl<'a> Plugin<'a> {
    pub fn new(
        conf: &'a NetConf,
        raw_conf: &'a [u8],
        host: &'a dyn Host,
        inventory: &'a dyn InventorySource,
        metadata: &'a dyn WorkloadMetadata,
        ipam: &'a dyn IpamDelegate,
    ) -> Self {
        Self {
            conf,
            raw_conf,
            host,
            sysfs: Sysfs::new(&conf.sysfs_root),
            store: ScratchStore::new(conf.scratch_dir()),
            inventory,
            metadata,
            ipam,
        }
    }

    fn manager(&self) -> VfManager<'_, dyn Host + 'a> {
        VfManager::new(self.host, &self.sysfs, &self.store)
    }

    /// Moves one VF per requested interface into the pod and runs IPAM on
    /// the result. Nothing is left behind in the pod on failure.
    pub fn attach(&self, args: &Options) -> Result<CniResult, PluginError> {
        if args.netns.is_empty() {
            return Err(PluginError::MissingNetns);
        }
        let netns = NetNs::open(&args.netns)?;

        let attached = if self.conf.legacy {
            vec![self.attach_legacy(args, &netns)?]
        } else {
            self.attach_placed(args, &netns)?
        };

        let mut result = CniResult {
            cni_version: self.conf.cni_version.clone(),
            ..Default::default()
        };
        if attached.is_empty() {
            tracing::info!(container_id = %args.container_id, "No interfaces requested");
            result.dns = self.conf.dns.clone();
            return Ok(result);
        }

        if !self.conf.skips_ipam() && !self.conf.ipam.ipam_type.is_empty() {
            let target = self.ipam_target(args, &attached);
            result = self.run_ipam(target, &attached, &netns)?;
            let position = attached.iter().position(|record| record.if_name == target);
            for ip in &mut result.ips {
                ip.interface = position;
            }
        }

        result.cni_version = self.conf.cni_version.clone();
        result.dns = self.conf.dns.clone();
        result.interfaces = attached
            .iter()
            .map(|record| ResultInterface {
                name: record.if_name.clone(),
                mac: record.hardware_address.clone(),
                sandbox: record.dpdk.is_none().then(|| args.netns.clone()),
            })
            .collect();
        Ok(result)
    }

    fn attach_placed(
        &self,
        args: &Options,
        netns: &NetNs,
    ) -> Result<Vec<PersistedInterfaceConfig>, PluginError> {
        let pod = PodRef::from_cni_args(&args.args)?;
        let requests = self.metadata.interface_requests(&pod)?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut pfs = self.inventory.physical_functions()?;
        sort_by_free_vfs(&mut pfs);
        let placement = place(&requests, &mut pfs)?;
        tracing::info!(%pod, requests = requests.len(), assignment = ?placement, "Placed interfaces");

        let manager = self.manager();
        let mut attached = Vec::with_capacity(requests.len());
        for (position, (request, &pf_index)) in requests.iter().zip(placement.iter()).enumerate() {
            let if_name = format!("eth{position}");
            let pf = &pfs[pf_index].name;
            match self.attach_one(&manager, args, pf, &if_name, Some(*request), netns) {
                Ok(record) => attached.push(record),
                Err(e) => {
                    self.rollback(&manager, &attached, netns);
                    return Err(e);
                }
            }
        }
        Ok(attached)
    }

    fn attach_legacy(
        &self,
        args: &Options,
        netns: &NetNs,
    ) -> Result<PersistedInterfaceConfig, PluginError> {
        let if_name = self.conf.if0_name.as_deref().unwrap_or(&args.if_name);
        let manager = self.manager();

        let mut last_err = None;
        for pf in self.sysfs.ordered_pfs(&self.conf.pf_candidates())? {
            match manager.locate(&pf, None) {
                Ok(_) => return self.attach_one(&manager, args, &pf, if_name, None, netns),
                Err(e) => {
                    tracing::debug!(pf, error = %e, "No usable VF, trying next PF");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| SriovError::DeviceNotFound {
                pf: self.conf.pf_candidates().join(","),
            })
            .into())
    }

    fn attach_one(
        &self,
        manager: &VfManager<'_, dyn Host + 'a>,
        args: &Options,
        pf: &str,
        if_name: &str,
        tx_rate: Option<InterfaceRequest>,
        netns: &NetNs,
    ) -> Result<PersistedInterfaceConfig, PluginError> {
        let vf = manager.locate(pf, None)?;
        let setup = VfSetup {
            container_id: &args.container_id,
            pod_if_name: if_name,
            vlan: self.conf.vlan,
            l2_mode: self.conf.l2_enable,
            dpdk: self.conf.dpdk_mode().then_some(&self.conf.dpdk),
            tx_rate,
        };

        manager.configure(&vf, &setup, netns).map_err(|failure| {
            let untouched = failure.state == VfState::VfLocated
                && matches!(failure.source, SriovError::SharedVfRequiresL2 { .. });
            if !untouched {
                self.release_and_discard(manager, &failure.record, netns);
            }
            failure.into()
        })
    }

    fn rollback(
        &self,
        manager: &VfManager<'_, dyn Host + 'a>,
        attached: &[PersistedInterfaceConfig],
        netns: &NetNs,
    ) {
        for record in attached.iter().rev() {
            tracing::warn!(if_name = %record.if_name, pf = %record.pf_name, vf = record.vf_index, "Rolling back interface");
            self.release_and_discard(manager, record, netns);
        }
    }

    fn release_and_discard(
        &self,
        manager: &VfManager<'_, dyn Host + 'a>,
        record: &PersistedInterfaceConfig,
        netns: &NetNs,
    ) {
        let report = manager.release(record, Some(netns));
        if !report.is_clean() {
            tracing::error!(if_name = %record.if_name, failures = ?report.failures, "Rollback left the VF partially configured");
        }
        if let Err(e) = self.store.discard(&record.container_id, &record.if_name) {
            tracing::warn!(error = %e, "Could not remove interface record");
        }
    }

    // `if0name` (or the runtime's interface name) if we attached it, else
    // the first interface.
    fn ipam_target<'r>(&'r self, args: &'r Options, attached: &'r [PersistedInterfaceConfig]) -> &'r str {
        let wanted = self.conf.if0_name.as_deref().unwrap_or(&args.if_name);
        attached
            .iter()
            .find(|record| record.if_name == wanted)
            .or_else(|| attached.first())
            .map(|record| record.if_name.as_str())
            .unwrap_or(wanted)
    }

    fn run_ipam(
        &self,
        target: &str,
        attached: &[PersistedInterfaceConfig],
        netns: &NetNs,
    ) -> Result<IpamResult, PluginError> {
        let ipam_type = &self.conf.ipam.ipam_type;
        let manager = self.manager();

        let result = match self.ipam.add(ipam_type, target, self.raw_conf) {
            Ok(result) => result,
            Err(e) => {
                self.rollback(&manager, attached, netns);
                return Err(e.into());
            }
        };

        let applied = with_netns(self.host, netns, || Ok(result.apply(self.host, target)))
            .unwrap_or_else(|source| {
                Err(IpamError::Apply {
                    if_name: target.to_string(),
                    source,
                })
            });
        if let Err(e) = applied {
            if let Err(del_err) = self.ipam.del(ipam_type, target, self.raw_conf) {
                tracing::warn!(error = %del_err, "Releasing IPAM allocation failed");
            }
            self.rollback(&manager, attached, netns);
            return Err(e.into());
        }
        Ok(result)
    }

    /// Returns every VF of the pod to the host. Per-interface failures are
    /// logged and skipped. A failed IPAM release is reported only after the
    /// interfaces are back on the host.
    pub fn detach(&self, args: &Options) -> Result<(), PluginError> {
        let ipam_released = if self.conf.ipam.ipam_type.is_empty() {
            Ok(())
        } else {
            let if_name = self.conf.if0_name.as_deref().unwrap_or(&args.if_name);
            self.ipam
                .del(&self.conf.ipam.ipam_type, if_name, self.raw_conf)
                .inspect_err(|e| tracing::error!(error = %e, "IPAM release failed"))
        };
        self.release_all(args)?;
        ipam_released?;
        Ok(())
    }

    fn release_all(&self, args: &Options) -> Result<(), PluginError> {
        if args.netns.is_empty() {
            return Ok(());
        }

        let manager = self.manager();
        let netns = match NetNs::open(&args.netns) {
            Ok(netns) => netns,
            Err(e) => {
                tracing::warn!(error = %e, "Pod namespace is gone, resetting VFs from records");
                self.release_without_namespace(&manager, &args.container_id);
                return Ok(());
            }
        };

        let links = with_netns(self.host, &netns, || self.host.links())?;
        let inventory = self.inventory.physical_functions().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Hardware inventory unavailable, cannot recover unrecorded VFs");
            Vec::new()
        });

        let mut names: Vec<String> = links
            .iter()
            .filter(|link| is_vf_interface_name(&link.name))
            .map(|link| link.name.clone())
            .collect();
        match self.store.interfaces_for(&args.container_id) {
            Ok(recorded) => names.extend(recorded),
            Err(e) => tracing::warn!(error = %e, "Listing interface records failed"),
        }
        names.sort();
        names.dedup();

        for name in names {
            match manager.release_persisted(&args.container_id, &name, Some(&netns)) {
                Ok(report) if report.is_clean() => {}
                Ok(report) => {
                    tracing::warn!(if_name = %name, failures = ?report.failures, "Released with failures")
                }
                Err(SriovError::ConfigNotFound { .. }) => {
                    let link = links.iter().find(|link| link.name == name);
                    self.release_recovered(&manager, &args.container_id, link, &inventory, &netns);
                }
                Err(e) => tracing::error!(if_name = %name, error = %e, "Releasing interface failed"),
            }
        }
        Ok(())
    }

    // No record was written for this interface, so find its VF through the
    // inventory by hardware address.
    fn release_recovered(
        &self,
        manager: &VfManager<'_, dyn Host + 'a>,
        container_id: &str,
        link: Option<&LinkInfo>,
        inventory: &[PhysicalFunction],
        netns: &NetNs,
    ) {
        let Some(link) = link else {
            return;
        };
        let Some(mac) = link.mac.as_deref() else {
            tracing::warn!(if_name = %link.name, "No record and no hardware address, skipping");
            return;
        };
        let Some((pf, vf)) = find_vf_by_hardware_address(inventory, mac) else {
            tracing::warn!(if_name = %link.name, mac, "No VF with this hardware address in inventory");
            return;
        };

        tracing::info!(if_name = %link.name, pf = %pf.name, vf = vf.index, "Recovered VF from hardware address");
        let record = PersistedInterfaceConfig {
            container_id: container_id.to_string(),
            if_name: link.name.clone(),
            pf_name: pf.name.clone(),
            vf_index: vf.index,
            pci_addr: String::new(),
            hardware_address: Some(mac.to_string()),
            shared_vf: false,
            shared_pf: None,
            vlan: 0,
            dpdk: None,
            tx_rate: None,
        };
        let report = manager.release(&record, Some(netns));
        if !report.is_clean() {
            tracing::warn!(if_name = %link.name, failures = ?report.failures, "Released with failures");
        }
    }

    fn release_without_namespace(&self, manager: &VfManager<'_, dyn Host + 'a>, container_id: &str) {
        let names = match self.store.interfaces_for(container_id) {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(error = %e, "Listing interface records failed");
                return;
            }
        };
        for name in names {
            match self.store.consume(container_id, &name) {
                Ok(record) => {
                    manager.release(&record, None);
                }
                Err(e) => tracing::error!(if_name = %name, error = %e, "Reading interface record failed"),
            }
        }
    }
}

/// `eth` followed by digits only; the names attach gives placed interfaces.
pub fn is_vf_interface_name(name: &str) -> bool {
    name.strip_prefix("eth")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}
