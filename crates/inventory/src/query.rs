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
use std::time::Duration;

use crate::{InventoryError, PhysicalFunction};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 54005;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1500);
pub const INVENTORY_PATH: &str = "getpfs";

/// Client for the node-local hardware inventory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInventory {
    pub address: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for NodeInventory {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl NodeInventory {
    pub fn new(address: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            port,
            timeout,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/{}", self.address, self.port, INVENTORY_PATH)
    }

    /// Fetches the current PF snapshot. Must not be called from inside an
    /// async runtime since it uses the blocking client.
    pub fn query(&self) -> Result<Vec<PhysicalFunction>, InventoryError> {
        let url = self.url();
        let query_err = |source| InventoryError::Query {
            url: url.clone(),
            source,
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(query_err)?;
        let body = client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .map_err(query_err)?;

        let pfs: Vec<PhysicalFunction> =
            serde_json::from_slice(&body).map_err(|source| InventoryError::Decode {
                url: url.clone(),
                source,
            })?;
        tracing::debug!(%url, pf_count = pfs.len(), "Fetched hardware inventory");
        Ok(pfs)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use super::*;

    // Serves exactly one HTTP response on an ephemeral port.
    fn serve_once(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        port
    }

    #[test]
    fn test_default_url() {
        assert_eq!(
            NodeInventory::default().url(),
            "http://127.0.0.1:54005/getpfs"
        );
    }

    #[test]
    fn test_query_parses_pfs() {
        let port = serve_once(
            "200 OK",
            r#"[{"name":"ens1f0","capacity_vfs":8,"capacity_tx_rate":1000,"vfs":[]}]"#,
        );
        let pfs = NodeInventory::new("127.0.0.1", port, Duration::from_secs(5))
            .query()
            .unwrap();
        assert_eq!(pfs.len(), 1);
        assert_eq!(pfs[0].name, "ens1f0");
        assert_eq!(pfs[0].free_vfs(), 8);
    }

    #[test]
    fn test_query_rejects_malformed_body() {
        let port = serve_once("200 OK", "not json");
        let err = NodeInventory::new("127.0.0.1", port, Duration::from_secs(5))
            .query()
            .unwrap_err();
        assert!(matches!(err, InventoryError::Decode { .. }));
    }

    #[test]
    fn test_query_reports_http_errors() {
        let port = serve_once("500 Internal Server Error", "");
        let err = NodeInventory::new("127.0.0.1", port, Duration::from_secs(5))
            .query()
            .unwrap_err();
        assert!(matches!(err, InventoryError::Query { .. }));
    }
}
