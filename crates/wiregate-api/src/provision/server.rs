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

use std::sync::Arc;

use chrono::Utc;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wiregate_types::api::UpdateServerConfigRequest;

use super::{Provisioner, ProvisionError, Result};
use crate::allocator::AllocError;
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::{PeerFilter, ServerConfig};
use crate::keys::{self, Keypair};
use crate::policy::{Action, Actor, Resource};
use crate::validate::FieldErrors;

/// The interface created on first start when no server row exists.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BootstrapServer {
    pub address: String,
    pub listen_port: u16,
    pub mtu: u16,
    pub post_up: String,
    pub post_down: String,
    pub dns: String,
}

impl Default for BootstrapServer {
    fn default() -> Self {
        Self {
            address: "100.100.100.1/24".into(),
            listen_port: 51820,
            mtu: 0,
            post_up: String::new(),
            post_down: String::new(),
            dns: String::new(),
        }
    }
}

#[derive(Default)]
struct ServerPatch {
    address: Option<Ipv4Network>,
    listen_port: Option<u16>,
    mtu: Option<u16>,
    keypair: Option<Keypair>,
}

fn check_address(errs: &mut FieldErrors, value: &str) -> Option<Ipv4Network> {
    let net = errs.ipv4_cidr("address", value)?;
    let ip = net.ip();
    if net.prefix() < 31 && (ip == net.network() || ip == net.broadcast()) {
        errs.add("address", "host");
        return None;
    }
    Some(net)
}

fn check_update(req: &UpdateServerConfigRequest) -> Result<ServerPatch> {
    let mut errs = FieldErrors::validate(req);
    let mut patch = ServerPatch::default();

    if let Some(address) = &req.address {
        patch.address = check_address(&mut errs, address);
    }
    patch.listen_port = req.listen_port.and_then(|p| u16::try_from(p).ok());
    patch.mtu = req.mtu.and_then(|m| u16::try_from(m).ok());
    // Anything below the IPv4 minimum MTU is refused; 0 means unset.
    if patch.mtu.is_some_and(|m| m != 0 && m < 576) {
        errs.add_with("mtu", "min", &[("min", "576".into())]);
    }
    if let Some(host) = &req.public_host {
        errs.host("public_host", host);
    }
    if let Some(dns) = &req.dns {
        errs.dns_list("dns", dns);
    }
    errs.finish()?;

    patch.keypair = req
        .private_key
        .as_deref()
        .map(keys::keypair_from_private)
        .transpose()?;
    Ok(patch)
}

impl<S: Store, A: Applier> Provisioner<S, A> {
    /// Creates the server interface from `bootstrap` unless one exists.
    #[tracing::instrument(skip(self, bootstrap))]
    pub async fn bootstrap_server(
        &self,
        bootstrap: &BootstrapServer,
        public_host: Option<String>,
    ) -> Result<ServerConfig> {
        if let Some(existing) = self.store.get_server().await? {
            return Ok(existing);
        }

        let mut errs = FieldErrors::new();
        let address = check_address(&mut errs, &bootstrap.address);
        errs.dns_list("dns", &bootstrap.dns);
        errs.finish()?;
        let address = address.ok_or_else(|| FieldErrors::single("address", "cidrv4"))?;

        let keypair = keys::generate_keypair()?;
        let server = ServerConfig {
            address,
            listen_port: bootstrap.listen_port,
            private_key: keypair.private_key,
            mtu: bootstrap.mtu,
            post_up: bootstrap.post_up.clone(),
            post_down: bootstrap.post_down.clone(),
            public_host: public_host.unwrap_or_default(),
            dns: bootstrap.dns.trim().to_string(),
            updated_at: Utc::now(),
        };
        self.store.save_server(&server).await?;
        info!(address = %server.address, public_key = %keypair.public_key, "created server interface");
        Ok(server)
    }

    pub async fn server_config(&self, actor: &Actor) -> Result<ServerConfig> {
        self.authorize(actor, Resource::WgServer, None, Action::Read)?;
        self.require_server().await
    }

    /// Rewrites the interface definition, then every artifact derived from it.
    #[tracing::instrument(skip(self, req, cancel), fields(user_id = %actor.user_id))]
    pub async fn update_server(
        self: &Arc<Self>,
        actor: Actor,
        req: UpdateServerConfigRequest,
        cancel: &CancellationToken,
    ) -> Result<ServerConfig> {
        self.authorize(&actor, Resource::WgServer, None, Action::Update)?;
        let patch = check_update(&req)?;

        self.exclusive(cancel, move |this| async move {
            let mut server = this.require_server().await?;

            if let Some(address) = patch.address {
                let ip = address.ip();
                if ip != server.host_ip() {
                    let peers = this.store.list_peers(&PeerFilter::default()).await?;
                    if peers.iter().any(|p| p.client_ip == Some(ip)) {
                        return Err(ProvisionError::Alloc(AllocError::ServerAddress(ip)));
                    }
                }
                server.address = address;
            }
            if let Some(port) = patch.listen_port {
                server.listen_port = port;
            }
            if let Some(mtu) = patch.mtu {
                server.mtu = mtu;
            }
            if let Some(keypair) = patch.keypair {
                server.private_key = keypair.private_key;
            }
            if let Some(post_up) = req.post_up {
                server.post_up = post_up;
            }
            if let Some(post_down) = req.post_down {
                server.post_down = post_down;
            }
            if let Some(host) = req.public_host {
                server.public_host = host.trim().to_string();
            }
            if let Some(dns) = req.dns {
                server.dns = dns.trim().to_string();
            }
            server.updated_at = Utc::now();

            this.store.save_server(&server).await?;
            info!(address = %server.address, port = server.listen_port, "updated server interface");
            this.publish_everything("update_server").await?;
            Ok(server)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("100.100.100.1/24", true ; "host address")]
    #[test_case("100.100.100.0/24", false ; "network address")]
    #[test_case("100.100.100.255/24", false ; "broadcast address")]
    #[test_case("10.0.0.1/32", true ; "single host")]
    #[test_case("garbage", false ; "unparseable")]
    fn tunnel_addresses(value: &str, ok: bool) {
        let mut errs = FieldErrors::new();
        assert_eq!(check_address(&mut errs, value).is_some(), ok);
        assert_eq!(errs.is_empty(), ok);
    }

    #[test_case(0, Some(0) ; "unset")]
    #[test_case(1420, Some(1420) ; "typical")]
    #[test_case(100, None ; "too small")]
    fn mtu_bounds(mtu: i64, expected: Option<u16>) {
        let req = UpdateServerConfigRequest {
            mtu: Some(mtu),
            ..UpdateServerConfigRequest::default()
        };
        let got = check_update(&req).ok().and_then(|patch| patch.mtu);
        assert_eq!(got, expected);
    }

    #[test]
    fn multiline_hooks_are_rejected() {
        let req = UpdateServerConfigRequest {
            post_up: Some("iptables -A FORWARD\n[Peer]".into()),
            ..UpdateServerConfigRequest::default()
        };
        match check_update(&req) {
            Err(ProvisionError::Validation(errs)) => {
                assert_eq!(errs.get("post_up"), Some("validation.printable"));
            }
            _ => panic!("expected validation error"),
        }
    }
}
