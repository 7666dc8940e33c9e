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

//! Lifecycle of a single VF: locate it under a PF, configure it for a pod,
//! and later hand it back to the host.
//!
//! ```text
//! Unconfigured -> VfLocated -> Configured -> InNamespace -> Released
//!                                         \-> DpdkBound  -/
//! ```
//!
//! Configuration stops at the first failure and reports how far it got; the
//! caller decides whether to release. Release is best effort and keeps going
//! past individual failures.

use std::fmt;

use rand::Rng;
use sriov_inventory::InterfaceRequest;

use crate::config::DpdkConf;
use crate::error::SriovError;
use crate::host::{Host, LinkInfo, with_netns};
use crate::netns::NetNs;
use crate::store::{PersistedInterfaceConfig, ScratchStore};
use crate::sysfs::Sysfs;

/// Most netdevs a single VF may expose (the two ports of a shared VF).
pub const MAX_SHARED_VF: usize = 2;

const PLACEHOLDER_RANGE: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfState {
    Unconfigured,
    VfLocated,
    Configured,
    InNamespace,
    DpdkBound,
    Released,
}

impl fmt::Display for VfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            VfState::Unconfigured => "unconfigured",
            VfState::VfLocated => "located",
            VfState::Configured => "configured",
            VfState::InNamespace => "in namespace",
            VfState::DpdkBound => "dpdk bound",
            VfState::Released => "released",
        };
        write!(f, "{state}")
    }
}

/// A free VF picked under a PF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedVf {
    pub pf: String,
    pub index: u32,
    pub pci_addr: String,
    /// Host netdevs of the VF ordered by interface index; two for a shared VF.
    pub netdevs: Vec<String>,
}

impl LocatedVf {
    pub fn is_shared(&self) -> bool {
        self.netdevs.len() == MAX_SHARED_VF
    }
}

/// What one pod interface should look like.
#[derive(Debug, Clone)]
pub struct VfSetup<'a> {
    pub container_id: &'a str,
    pub pod_if_name: &'a str,
    pub vlan: u16,
    pub l2_mode: bool,
    pub dpdk: Option<&'a DpdkConf>,
    pub tx_rate: Option<InterfaceRequest>,
}

/// Configuration stopped at `state`. `record` describes what may need to be
/// released.
#[derive(thiserror::Error, Debug)]
#[error("Configuring {} on {} VF {} failed after reaching '{state}': {source}", .record.if_name, .record.pf_name, .record.vf_index)]
pub struct SetupFailure {
    pub state: VfState,
    pub record: Box<PersistedInterfaceConfig>,
    #[source]
    pub source: SriovError,
}

/// Outcome of a best-effort release.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Pod-side devices returned to the host namespace.
    pub returned: Vec<String>,
    /// Pod-side devices that were not found and skipped.
    pub missing: Vec<String>,
    pub failures: Vec<SriovError>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<T>(&mut self, result: Result<T, SriovError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Release step failed, continuing");
                self.failures.push(e);
                None
            }
        }
    }
}

pub struct VfManager<'a, H: Host + ?Sized> {
    host: &'a H,
    sysfs: &'a Sysfs,
    store: &'a ScratchStore,
}

impl<'a, H: Host + ?Sized> VfManager<'a, H> {
    pub fn new(host: &'a H, sysfs: &'a Sysfs, store: &'a ScratchStore) -> Self {
        Self { host, sysfs, store }
    }

    /// Picks a VF under `pf`. With `chosen` only that VF is considered,
    /// otherwise the first VF with any host netdev wins. That VF must have
    /// at most `MAX_SHARED_VF` of them.
    pub fn locate(&self, pf: &str, chosen: Option<u32>) -> Result<LocatedVf, SriovError> {
        let total = self.sysfs.num_vfs(pf)?;
        let candidates: Vec<u32> = match chosen {
            Some(vf) if vf < total => vec![vf],
            Some(_) => Vec::new(),
            None => (0..total).collect(),
        };

        for vf in candidates {
            let netdevs = self.sysfs.vf_netdevs(pf, vf)?;
            match netdevs.len() {
                0 => continue,
                count if count > MAX_SHARED_VF => {
                    return Err(SriovError::AmbiguousDevice {
                        pf: pf.to_string(),
                        vf,
                        count,
                        max: MAX_SHARED_VF,
                    });
                }
                _ => {
                    let pci_addr = self.sysfs.vf_pci_address(pf, vf)?;
                    tracing::debug!(pf, vf, %pci_addr, ?netdevs, "Located VF");
                    return Ok(LocatedVf {
                        pf: pf.to_string(),
                        index: vf,
                        pci_addr,
                        netdevs,
                    });
                }
            }
        }

        Err(SriovError::DeviceNotFound { pf: pf.to_string() })
    }

    /// Applies VLAN, tx rate and then either the DPDK driver or the move
    /// into `netns`, and persists the result.
    pub fn configure(
        &self,
        vf: &LocatedVf,
        setup: &VfSetup<'_>,
        netns: &NetNs,
    ) -> Result<PersistedInterfaceConfig, SetupFailure> {
        let mut progress = Progress {
            state: VfState::VfLocated,
            record: PersistedInterfaceConfig {
                container_id: setup.container_id.to_string(),
                if_name: setup.pod_if_name.to_string(),
                pf_name: vf.pf.clone(),
                vf_index: vf.index,
                pci_addr: vf.pci_addr.clone(),
                hardware_address: None,
                shared_vf: vf.is_shared(),
                shared_pf: None,
                vlan: setup.vlan,
                dpdk: setup.dpdk.cloned(),
                tx_rate: setup.tx_rate,
            },
        };

        match self.configure_steps(vf, setup, netns, &mut progress) {
            Ok(()) => Ok(progress.record),
            Err(source) => {
                // Only a bound VF needs to go back to its kernel driver.
                if progress.state != VfState::DpdkBound {
                    progress.record.dpdk = None;
                }
                Err(SetupFailure {
                    state: progress.state,
                    record: Box::new(progress.record),
                    source,
                })
            }
        }
    }

    fn configure_steps(
        &self,
        vf: &LocatedVf,
        setup: &VfSetup<'_>,
        netns: &NetNs,
        progress: &mut Progress,
    ) -> Result<(), SriovError> {
        if vf.is_shared() {
            if !setup.l2_mode {
                return Err(SriovError::SharedVfRequiresL2 {
                    pf: vf.pf.clone(),
                    vf: vf.index,
                });
            }
            let sibling = self
                .sysfs
                .shared_sibling(&vf.pf)?
                .ok_or_else(|| SriovError::LinkNotFound {
                    name: format!("shared PF of {}", vf.pf),
                })?;
            progress.record.shared_pf = Some(sibling);
        }

        let primary = self.host_link(&vf.netdevs[0])?;
        progress.record.hardware_address = primary.mac.clone();

        if setup.vlan != 0 {
            self.host.set_vf_vlan(&vf.pf, vf.index, setup.vlan)?;
            if let Some(sibling) = &progress.record.shared_pf {
                self.host.set_vf_vlan(sibling, vf.index, setup.vlan)?;
            }
        }
        if let Some(rate) = &setup.tx_rate {
            self.host.set_vf_rate(&vf.pf, vf.index, rate)?;
        }
        progress.state = VfState::Configured;

        if let Some(dpdk) = setup.dpdk {
            self.host
                .bind_driver(&dpdk.dpdk_tool, &dpdk.dpdk_driver, &vf.netdevs[0])?;
            progress.state = VfState::DpdkBound;
        } else {
            for (position, netdev) in vf.netdevs.iter().enumerate() {
                let link = if position == 0 {
                    primary.clone()
                } else {
                    self.host_link(netdev)?
                };
                let pod_name = pod_device_name(setup.pod_if_name, position);
                self.move_into_pod(link, &pod_name, setup.l2_mode, netns)?;
            }
            progress.state = VfState::InNamespace;
        }

        self.store.save(&progress.record)?;
        tracing::info!(
            pf = %vf.pf,
            vf = vf.index,
            if_name = setup.pod_if_name,
            state = %progress.state,
            "Configured VF"
        );
        Ok(())
    }

    fn host_link(&self, name: &str) -> Result<LinkInfo, SriovError> {
        self.host
            .link_by_name(name)?
            .ok_or_else(|| SriovError::LinkNotFound {
                name: name.to_string(),
            })
    }

    fn move_into_pod(
        &self,
        mut link: LinkInfo,
        pod_name: &str,
        l2_mode: bool,
        netns: &NetNs,
    ) -> Result<(), SriovError> {
        // The pod side will want eth0 for itself; get it out of the way
        // before the host namespace has two of them.
        if link.name == "eth0" {
            let placeholder = format!(
                "sriov{}",
                rand::rng().random_range(0..PLACEHOLDER_RANGE)
            );
            self.host.rename_link(link.index, &placeholder)?;
            link.name = placeholder;
        }
        self.host.set_link_up(link.index)?;
        self.host.move_link(link.index, netns)?;

        with_netns(self.host, netns, || {
            let moved = self.host_link(&link.name)?;
            self.host.rename_link(moved.index, pod_name)?;
            if l2_mode {
                self.host.set_link_up(moved.index)?;
            }
            Ok(())
        })?;
        tracing::debug!(from = %link.name, to = pod_name, "Moved VF netdev into pod");
        Ok(())
    }

    /// Hands the VF described by `record` back to the host. `netns` is the
    /// pod namespace, or `None` when it no longer exists; in that case only
    /// the VF settings are reset.
    pub fn release(
        &self,
        record: &PersistedInterfaceConfig,
        netns: Option<&NetNs>,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        if let Some(dpdk) = &record.dpdk {
            let rebind =
                self.host
                    .bind_driver(&dpdk.dpdk_tool, &dpdk.kernel_driver, &record.pci_addr);
            report.record(rebind);
            report.record(self.host.set_vf_vlan(&record.pf_name, record.vf_index, 0));
            tracing::info!(pf = %record.pf_name, vf = record.vf_index, "Released DPDK VF");
            return report;
        }

        if let Some(netns) = netns {
            let mut legs = vec![(record.if_name.clone(), record.hardware_address.as_deref())];
            if record.shared_vf {
                legs.push((pod_device_name(&record.if_name, 1), None));
            }
            for (pod_name, mac) in legs {
                self.return_to_host(&pod_name, mac, netns, &mut report);
            }
        }

        report.record(self.host.set_vf_vlan(&record.pf_name, record.vf_index, 0));
        if let Some(sibling) = &record.shared_pf {
            report.record(self.host.set_vf_vlan(sibling, record.vf_index, 0));
        }
        report.record(self.host.set_vf_rate(
            &record.pf_name,
            record.vf_index,
            &InterfaceRequest::default(),
        ));
        if let Some(sibling) = &record.shared_pf {
            report.record(self.host.set_vf_rate(
                sibling,
                record.vf_index,
                &InterfaceRequest::default(),
            ));
        }

        tracing::info!(
            pf = %record.pf_name,
            vf = record.vf_index,
            if_name = %record.if_name,
            state = %VfState::Released,
            failures = report.failures.len(),
            "Released VF"
        );
        report
    }

    /// Reads the persisted record for the interface, then releases it.
    pub fn release_persisted(
        &self,
        container_id: &str,
        if_name: &str,
        netns: Option<&NetNs>,
    ) -> Result<ReleaseReport, SriovError> {
        let record = self.store.consume(container_id, if_name)?;
        Ok(self.release(&record, netns))
    }

    fn return_to_host(
        &self,
        pod_name: &str,
        mac: Option<&str>,
        netns: &NetNs,
        report: &mut ReleaseReport,
    ) {
        let origin = self.host.origin_netns();
        let result = with_netns(self.host, netns, || {
            let links = self.host.links()?;
            // A known MAC is authoritative: the pod may hold an unrelated
            // device under the name we wanted.
            let found = match mac {
                Some(mac) => links.iter().find(|link| {
                    link.mac
                        .as_deref()
                        .is_some_and(|have| have.eq_ignore_ascii_case(mac))
                }),
                None => links.iter().find(|link| link.name == pod_name),
            };
            let Some(link) = found else {
                return Ok(false);
            };
            self.host.set_link_down(link.index)?;
            self.host
                .rename_link(link.index, &format!("dev{}", link.index))?;
            self.host.move_link(link.index, origin)?;
            Ok(true)
        });

        match report.record(result) {
            Some(true) => report.returned.push(pod_name.to_string()),
            Some(false) => {
                tracing::info!(pod_name, "Device not present in pod namespace, skipping");
                report.missing.push(pod_name.to_string());
            }
            None => {}
        }
    }
}

struct Progress {
    state: VfState,
    record: PersistedInterfaceConfig,
}

/// Name of the `position`th netdev of a pod interface: the interface name
/// itself, then `<name>d1` for the second port of a shared VF.
pub fn pod_device_name(pod_if_name: &str, position: usize) -> String {
    if position == 0 {
        pod_if_name.to_string()
    } else {
        format!("{pod_if_name}d{position}")
    }
}
