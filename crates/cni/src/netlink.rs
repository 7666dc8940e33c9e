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
use std::future::Future;
use std::net::IpAddr;

use futures_util::TryStreamExt;
use ipnetwork::IpNetwork;
use mac_address::MacAddress;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use sriov_inventory::InterfaceRequest;

use crate::cmd::Cmd;
use crate::error::SriovError;
use crate::host::{Host, LinkInfo};
use crate::netns::{NetNs, PinnedContext};

/// [`Host`] backed by rtnetlink for links and by `ip`/the DPDK bind tool
/// for VF settings.
#[derive(Debug)]
pub struct LinuxHost {
    context: PinnedContext,
}

impl LinuxHost {
    pub fn new() -> Result<Self, SriovError> {
        Ok(Self {
            context: PinnedContext::acquire()?,
        })
    }

    // A fresh connection per request: a netlink socket stays bound to the
    // namespace it was opened in.
    fn request<F, Fut, T>(&self, f: F) -> Result<T, SriovError>
    where
        F: FnOnce(rtnetlink::Handle) -> Fut,
        Fut: Future<Output = Result<T, SriovError>>,
    {
        self.context.block_on(async move {
            let (connection, handle, _receiver) =
                rtnetlink::new_connection().map_err(SriovError::Runtime)?;
            let connection_task = tokio::spawn(connection);
            let result = f(handle).await;
            connection_task.abort();
            result
        })
    }
}

impl From<&LinkMessage> for LinkInfo {
    fn from(link_message: &LinkMessage) -> Self {
        let name = link_message
            .attributes
            .iter()
            .find_map(|attribute| match attribute {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let mac = link_message
            .attributes
            .iter()
            .find_map(|attribute| match attribute {
                LinkAttribute::Address(address) => <[u8; 6]>::try_from(address.as_slice()).ok(),
                _ => None,
            })
            .map(|bytes| MacAddress::new(bytes).to_string().to_lowercase());
        LinkInfo {
            index: link_message.header.index,
            name,
            mac,
        }
    }
}

impl Host for LinuxHost {
    fn origin_netns(&self) -> &NetNs {
        self.context.origin()
    }

    fn enter_netns(&self, netns: &NetNs) -> Result<(), SriovError> {
        tracing::trace!(netns = %netns.path().display(), "Entering network namespace");
        self.context.enter(netns)
    }

    fn links(&self) -> Result<Vec<LinkInfo>, SriovError> {
        self.request(|handle| async move {
            handle
                .link()
                .get()
                .execute()
                .map_err(|e| SriovError::link_failed("*", "list", e))
                .try_filter_map(|link_message| async move {
                    let link = LinkInfo::from(&link_message);
                    if link.name.is_empty() {
                        tracing::warn!(
                            "Network interface with index {} doesn't have a name (no IfName attribute)",
                            link.index
                        );
                        return Ok(None);
                    }
                    Ok(Some(link))
                })
                .try_collect()
                .await
        })
    }

    fn set_link_up(&self, index: u32) -> Result<(), SriovError> {
        self.request(|handle| async move {
            handle
                .link()
                .set(index)
                .up()
                .execute()
                .await
                .map_err(|e| SriovError::link_failed(format!("index {index}"), "up", e))
        })
    }

    fn set_link_down(&self, index: u32) -> Result<(), SriovError> {
        self.request(|handle| async move {
            handle
                .link()
                .set(index)
                .down()
                .execute()
                .await
                .map_err(|e| SriovError::link_failed(format!("index {index}"), "down", e))
        })
    }

    fn rename_link(&self, index: u32, name: &str) -> Result<(), SriovError> {
        let name = name.to_string();
        self.request(|handle| async move {
            handle
                .link()
                .set(index)
                .name(name.clone())
                .execute()
                .await
                .map_err(|e| SriovError::link_failed(name, "rename", e))
        })
    }

    fn move_link(&self, index: u32, netns: &NetNs) -> Result<(), SriovError> {
        let fd = netns.raw_fd();
        self.request(|handle| async move {
            handle
                .link()
                .set(index)
                .setns_by_fd(fd)
                .execute()
                .await
                .map_err(|e| SriovError::link_failed(format!("index {index}"), "setns", e))
        })
    }

    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), SriovError> {
        self.request(|handle| async move {
            handle
                .address()
                .add(index, address.ip(), address.prefix())
                .execute()
                .await
                .map_err(|e| SriovError::link_failed(format!("index {index}"), "add address", e))
        })
    }

    fn add_route(
        &self,
        index: u32,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), SriovError> {
        let route_err = move |reason: String| {
            SriovError::link_failed(format!("index {index}"), "add route", reason)
        };
        self.request(|handle| async move {
            let result = match (destination, gateway) {
                (IpNetwork::V4(destination), None | Some(IpAddr::V4(_))) => {
                    let mut request = handle
                        .route()
                        .add()
                        .v4()
                        .destination_prefix(destination.ip(), destination.prefix())
                        .output_interface(index);
                    if let Some(IpAddr::V4(gateway)) = gateway {
                        request = request.gateway(gateway);
                    }
                    request.execute().await
                }
                (IpNetwork::V6(destination), None | Some(IpAddr::V6(_))) => {
                    let mut request = handle
                        .route()
                        .add()
                        .v6()
                        .destination_prefix(destination.ip(), destination.prefix())
                        .output_interface(index);
                    if let Some(IpAddr::V6(gateway)) = gateway {
                        request = request.gateway(gateway);
                    }
                    request.execute().await
                }
                (destination, gateway) => {
                    return Err(route_err(format!(
                        "gateway {gateway:?} is not in the address family of {destination}"
                    )));
                }
            };
            result.map_err(|e| route_err(e.to_string()))
        })
    }

    fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<(), SriovError> {
        Cmd::new("ip")
            .args(["link", "set", "dev", pf, "vf", &vf.to_string(), "vlan", &vlan.to_string()])
            .output()
            .map(|_| ())
            .map_err(|e| SriovError::VlanFailed {
                pf: pf.to_string(),
                vf,
                vlan,
                reason: e.to_string(),
            })
    }

    fn set_vf_rate(&self, pf: &str, vf: u32, rate: &InterfaceRequest) -> Result<(), SriovError> {
        Cmd::new("ip")
            .args([
                "link",
                "set",
                "dev",
                pf,
                "vf",
                &vf.to_string(),
                "max_tx_rate",
                &rate.max_tx_rate.to_string(),
                "min_tx_rate",
                &rate.min_tx_rate.to_string(),
            ])
            .output()
            .map(|_| ())
            .map_err(|e| SriovError::RateLimitFailed {
                pf: pf.to_string(),
                vf,
                reason: e.to_string(),
            })
    }

    fn bind_driver(&self, tool: &str, driver: &str, device: &str) -> Result<(), SriovError> {
        Cmd::new(tool)
            .args(["-b", driver, device])
            .output()
            .map(|_| ())
            .map_err(|e| SriovError::DriverBindFailed {
                device: device.to_string(),
                driver: driver.to_string(),
                reason: e.to_string(),
            })
    }
}
