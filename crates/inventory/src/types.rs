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
use std::str::FromStr;

use mac_address::MacAddress;
use serde::{Deserialize, Serialize};

/// An SR-IOV enabled physical function and its bandwidth/VF accounting.
///
/// Counters are in the units the inventory service reports them (Mbit/s for
/// rates). `used_*` never exceeds `capacity_*` in data handed out by the
/// placement solver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalFunction {
    pub name: String,
    #[serde(default)]
    pub used_tx_rate: u64,
    #[serde(default)]
    pub capacity_tx_rate: u64,
    #[serde(default)]
    pub used_vfs: u32,
    #[serde(default)]
    pub capacity_vfs: u32,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub vfs: Vec<VirtualFunction>,
}

impl PhysicalFunction {
    pub fn free_vfs(&self) -> u32 {
        self.capacity_vfs.saturating_sub(self.used_vfs)
    }

    /// Returns the VF whose MAC matches `mac`. Addresses are compared by
    /// value, so `AA:BB:..` and `aa:bb:..` are the same address.
    pub fn find_vf_by_hardware_address(&self, mac: &str) -> Option<&VirtualFunction> {
        let wanted = MacAddress::from_str(mac).ok();
        self.vfs.iter().find(|vf| match (wanted, vf.hardware_address()) {
            (Some(wanted), Some(have)) => wanted == have,
            _ => vf.mac.eq_ignore_ascii_case(mac),
        })
    }
}

/// Searches every PF for a VF carrying `mac`.
pub fn find_vf_by_hardware_address<'a>(
    pfs: &'a [PhysicalFunction],
    mac: &str,
) -> Option<(&'a PhysicalFunction, &'a VirtualFunction)> {
    pfs.iter()
        .find_map(|pf| pf.find_vf_by_hardware_address(mac).map(|vf| (pf, vf)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFunction {
    #[serde(rename = "vf")]
    pub index: u32,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub qos: u32,
    #[serde(default)]
    pub vlan_proto: String,
    #[serde(default)]
    pub spoof_check: String,
    #[serde(default)]
    pub trust: String,
    #[serde(default)]
    pub link_state: String,
    #[serde(default)]
    pub min_tx_rate: u64,
    #[serde(default)]
    pub max_tx_rate: u64,
    #[serde(default)]
    pub vgt_plus: String,
    #[serde(default)]
    pub rate_group: u32,
    #[serde(default)]
    pub allocated: bool,
}

impl VirtualFunction {
    pub fn hardware_address(&self) -> Option<MacAddress> {
        MacAddress::from_str(&self.mac).ok()
    }
}

/// Bandwidth guarantee requested for one pod interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRequest {
    #[serde(default)]
    pub min_tx_rate: u64,
    #[serde(default)]
    pub max_tx_rate: u64,
}

// The inventory service encodes an empty VF list as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<VirtualFunction>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<VirtualFunction>>::deserialize(deserializer)?.unwrap_or_default())
}
