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

//! Assignment of requested pod interfaces to physical functions.
//!
//! Placement is a bounded backtracking search over the PF list. Each
//! request needs one free VF and at least its `min_tx_rate` of unreserved
//! transmit bandwidth on the PF that hosts it. `max_tx_rate` is a ceiling
//! applied later by the VF configuration and takes no part in feasibility.

use std::ops::Deref;

use sriov_inventory::{InterfaceRequest, PhysicalFunction};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("{requests} interface request(s) cannot be placed on {pfs} physical function(s)")]
    Infeasible { requests: usize, pfs: usize },
}

/// PF index per request, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement(Vec<usize>);

impl Placement {
    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }
}

impl Deref for Placement {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

/// Places every request on a PF.
///
/// On success the usage counters of `pfs` include exactly the returned
/// assignment. On failure they are identical to what they were on entry.
/// Candidates are tried in slice order, so the caller controls tie-breaking
/// by sorting `pfs` beforehand (see [`sort_by_free_vfs`]).
pub fn place(
    requests: &[InterfaceRequest],
    pfs: &mut [PhysicalFunction],
) -> Result<Placement, PlacementError> {
    let mut chosen: Vec<usize> = Vec::with_capacity(requests.len());
    let mut next_candidate = 0;

    while let Some(request) = requests.get(chosen.len()) {
        let fit = (next_candidate..pfs.len()).find(|&candidate| fits(&pfs[candidate], request));
        tracing::trace!(
            request = chosen.len(),
            min_tx_rate = request.min_tx_rate,
            next_candidate,
            ?fit,
            "Placement step"
        );

        match fit {
            Some(candidate) => {
                reserve(&mut pfs[candidate], request);
                chosen.push(candidate);
                next_candidate = 0;
            }
            None => {
                let Some(previous) = chosen.pop() else {
                    return Err(PlacementError::Infeasible {
                        requests: requests.len(),
                        pfs: pfs.len(),
                    });
                };
                unreserve(&mut pfs[previous], &requests[chosen.len()]);
                next_candidate = previous + 1;
            }
        }
    }

    tracing::debug!(assignment = ?chosen, "Placed interface requests");
    Ok(Placement(chosen))
}

/// Stable sort putting the PFs with the most free VFs first.
pub fn sort_by_free_vfs(pfs: &mut [PhysicalFunction]) {
    pfs.sort_by_key(|pf| std::cmp::Reverse(pf.free_vfs()));
}

fn fits(pf: &PhysicalFunction, request: &InterfaceRequest) -> bool {
    let has_vf = pf
        .capacity_vfs
        .checked_sub(pf.used_vfs)
        .is_some_and(|free| free > 0);
    let has_rate = pf
        .capacity_tx_rate
        .checked_sub(pf.used_tx_rate)
        .is_some_and(|free| free >= request.min_tx_rate);
    has_vf && has_rate
}

fn reserve(pf: &mut PhysicalFunction, request: &InterfaceRequest) {
    pf.used_vfs += 1;
    pf.used_tx_rate += request.min_tx_rate;
}

fn unreserve(pf: &mut PhysicalFunction, request: &InterfaceRequest) {
    pf.used_vfs -= 1;
    pf.used_tx_rate -= request.min_tx_rate;
}
