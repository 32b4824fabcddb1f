// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PublicIpConfig;

const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("detection service returned {0}")]
    Status(u16),

    #[error("detection service returned {0:?}, not an IP address")]
    NotAnAddress(String),
}

/// The host clients should dial: the configured address if any, else the
/// detected one when detection is on. Detection failures only warn.
pub async fn resolve(config: &PublicIpConfig) -> Option<String> {
    let declared = config.address.trim();
    if !declared.is_empty() {
        return Some(declared.to_string());
    }
    if !config.detect {
        return None;
    }

    match detect(&config.detect_url).await {
        Ok(ip) => {
            info!(%ip, "detected public address");
            Some(ip.to_string())
        }
        Err(e) => {
            warn!(url = %config.detect_url, error = %e, "public address detection failed");
            None
        }
    }
}

#[tracing::instrument]
pub async fn detect(url: &str) -> Result<IpAddr, DetectError> {
    let client = Client::builder().timeout(DETECT_TIMEOUT).build()?;
    let resp = client.get(url).send().await?;

    let status = resp.status().as_u16();
    debug!(status, "received detection response");
    if status != 200 {
        return Err(DetectError::Status(status));
    }

    let body = resp.text().await?;
    parse_address(&body)
}

fn parse_address(body: &str) -> Result<IpAddr, DetectError> {
    let text = body.trim();
    text.parse()
        .map_err(|_| DetectError::NotAnAddress(text.chars().take(64).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("203.0.113.7\n", true ; "v4 with newline")]
    #[test_case("2001:db8::1", true ; "v6")]
    #[test_case("<html>rate limited</html>", false ; "html")]
    #[test_case("", false ; "empty")]
    fn detection_bodies(body: &str, ok: bool) {
        assert_eq!(parse_address(body).is_ok(), ok);
    }

    #[tokio::test]
    async fn declared_address_wins() {
        let config = PublicIpConfig {
            address: " vpn.example.com ".into(),
            detect: true,
            detect_url: "http://127.0.0.1:1".into(),
        };
        assert_eq!(resolve(&config).await.as_deref(), Some("vpn.example.com"));
    }

    #[tokio::test]
    async fn nothing_without_detection() {
        let config = PublicIpConfig::default();
        assert_eq!(resolve(&config).await, None);
    }
}
