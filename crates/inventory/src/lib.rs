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

//! Model of the SR-IOV hardware present on a node, as reported by the
//! node-local hardware inventory service, plus the client that fetches it.

mod query;
mod types;

pub use query::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_TIMEOUT, INVENTORY_PATH, NodeInventory};
pub use types::{InterfaceRequest, PhysicalFunction, VirtualFunction, find_vf_by_hardware_address};

#[derive(thiserror::Error, Debug)]
pub enum InventoryError {
    #[error("Failed querying hardware inventory at {url}: {source}")]
    Query {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Hardware inventory at {url} returned malformed data: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}
