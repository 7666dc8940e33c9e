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
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use sriov_inventory::InterfaceRequest;

use crate::error::SriovError;
use crate::netns::NetNs;

/// A network device as seen from the current namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    /// `aa:bb:cc:dd:ee:ff`, absent for devices without a hardware address.
    pub mac: Option<String>,
}

/// Host operations the VF lifecycle needs.
///
/// Link operations act on the namespace the implementation is currently in;
/// VF operations are addressed through the PF and must be issued from the
/// namespace that owns the PF.
pub trait Host {
    fn origin_netns(&self) -> &NetNs;
    fn enter_netns(&self, netns: &NetNs) -> Result<(), SriovError>;

    fn links(&self) -> Result<Vec<LinkInfo>, SriovError>;
    fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, SriovError> {
        Ok(self.links()?.into_iter().find(|link| link.name == name))
    }
    fn set_link_up(&self, index: u32) -> Result<(), SriovError>;
    fn set_link_down(&self, index: u32) -> Result<(), SriovError>;
    fn rename_link(&self, index: u32, name: &str) -> Result<(), SriovError>;
    fn move_link(&self, index: u32, netns: &NetNs) -> Result<(), SriovError>;
    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), SriovError>;
    fn add_route(
        &self,
        index: u32,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), SriovError>;

    fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<(), SriovError>;
    fn set_vf_rate(&self, pf: &str, vf: u32, rate: &InterfaceRequest) -> Result<(), SriovError>;
    fn bind_driver(&self, tool: &str, driver: &str, device: &str) -> Result<(), SriovError>;
}

/// Runs `f` inside `netns` and switches back to the origin namespace
/// afterwards, whether or not `f` succeeded.
pub fn with_netns<H, T, F>(host: &H, netns: &NetNs, f: F) -> Result<T, SriovError>
where
    H: Host + ?Sized,
    F: FnOnce() -> Result<T, SriovError>,
{
    host.enter_netns(netns)?;
    let result = f();
    let restored = host.enter_netns(host.origin_netns());
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), restored) => {
            if let Err(restore_err) = restored {
                tracing::error!(error = %restore_err, "Failed to return to the original network namespace");
            }
            Err(e)
        }
    }
}
