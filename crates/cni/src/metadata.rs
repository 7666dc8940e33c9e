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
use std::path::PathBuf;

use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Api, Client, Config};
use sriov_inventory::InterfaceRequest;

use crate::config::PodRef;

/// Pod annotation carrying the JSON list of requested interfaces.
pub const INTERFACES_ANNOTATION: &str = "rdma_interfaces_required";

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
    #[error("Loading kubeconfig {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },
    #[error("Looking up pod {pod}: {source}")]
    Api {
        pod: String,
        #[source]
        source: kube::Error,
    },
    #[error("Annotation {INTERFACES_ANNOTATION} on pod {pod} is malformed: {source}")]
    Annotation {
        pod: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Starting runtime for the Kubernetes client failed: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Source of the bandwidth requests of a workload.
#[cfg_attr(test, mockall::automock)]
pub trait WorkloadMetadata {
    /// An empty list when the pod asks for nothing.
    fn interface_requests(&self, pod: &PodRef) -> Result<Vec<InterfaceRequest>, MetadataError>;
}

/// Reads pod annotations from the Kubernetes API using the node's kubeconfig.
#[derive(Debug, Clone)]
pub struct KubeMetadata {
    kubeconfig: PathBuf,
}

impl KubeMetadata {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }

    async fn annotation(&self, pod: &PodRef) -> Result<Option<String>, MetadataError> {
        let kubeconfig_err = |source| MetadataError::Kubeconfig {
            path: self.kubeconfig.clone(),
            source,
        };
        let api_err = |source| MetadataError::Api {
            pod: pod.to_string(),
            source,
        };

        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig).map_err(kubeconfig_err)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(kubeconfig_err)?;
        let client = Client::try_from(config).map_err(api_err)?;

        let pods: Api<Pod> = Api::namespaced(client, &pod.namespace);
        let found = pods.get(&pod.name).await.map_err(api_err)?;
        Ok(found
            .metadata
            .annotations
            .and_then(|mut annotations| annotations.remove(INTERFACES_ANNOTATION)))
    }
}

impl WorkloadMetadata for KubeMetadata {
    fn interface_requests(&self, pod: &PodRef) -> Result<Vec<InterfaceRequest>, MetadataError> {
        rustls::crypto::ring::default_provider()
            .install_default()
            .inspect_err(|crypto_provider| {
                tracing::debug!("Crypto provider already configured: {crypto_provider:?}")
            })
            .ok(); // if something else is already default, ignore.

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(MetadataError::Runtime)?;
        let annotation = runtime.block_on(self.annotation(pod))?;
        parse_interface_requests(pod, annotation.as_deref())
    }
}

/// Decodes the annotation value. Missing or empty means no interfaces.
pub fn parse_interface_requests(
    pod: &PodRef,
    annotation: Option<&str>,
) -> Result<Vec<InterfaceRequest>, MetadataError> {
    match annotation.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(value) => serde_json::from_str(value).map_err(|source| MetadataError::Annotation {
            pod: pod.to_string(),
            source,
        }),
    }
}
