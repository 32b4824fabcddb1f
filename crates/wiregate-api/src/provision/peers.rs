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

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;
use wiregate_types::PeerStatus;
use wiregate_types::api::{BatchUpdatePeerItem, CreatePeerRequest, UpdatePeerRequest};

use super::{Provisioner, ProvisionError, Publish, Result, at_index, check_batch};
use crate::allocator::{AllocError, IpAllocator, parse_host};
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::{IpPool, Peer, PeerFilter};
use crate::keys::{self, Keypair};
use crate::policy::{Action, Actor, Resource};
use crate::render::{self, ClientContext};
use crate::validate::FieldErrors;

pub const MAX_AVAILABLE: usize = 256;

// ---------------------------------------------------------------------------
// Request checks
// ---------------------------------------------------------------------------

/// Parsed parts of a create request that passed shape validation.
struct CreateChecked {
    owner: Uuid,
    client_ip: Option<Ipv4Addr>,
    keepalive: u16,
    keypair: Option<Keypair>,
}

struct UpdateChecked {
    client_ip: Option<Ipv4Addr>,
    keepalive: Option<u16>,
    keypair: Option<Keypair>,
}

fn parse_client_ip(errs: &mut FieldErrors, text: Option<&str>) -> Option<Ipv4Addr> {
    let text = text.map(str::trim).filter(|t| !t.is_empty())?;
    let ip = parse_host(text);
    if ip.is_none() {
        errs.add("client_ip", "ipv4");
    }
    ip
}

/// Narrows a keepalive that has already passed its range rule.
fn keepalive(value: Option<i64>) -> Option<u16> {
    value.map(|k| u16::try_from(k).unwrap_or_default())
}

fn check_create(actor: &Actor, req: &CreatePeerRequest) -> Result<CreateChecked> {
    let mut errs = FieldErrors::validate(req);
    let client_ip = parse_client_ip(&mut errs, req.client_ip.as_deref());
    errs.cidr_list("allowed_ips", &req.allowed_ips);
    errs.dns_list("dns", &req.dns);
    errs.endpoint("endpoint", &req.endpoint);
    if req.ip_pool_id.is_none() && req.client_ip.as_deref().is_none_or(|t| t.trim().is_empty()) {
        errs.add("ip_pool_id", "required");
    }
    errs.finish()?;

    let keypair = req
        .private_key
        .as_deref()
        .map(keys::keypair_from_private)
        .transpose()?;

    Ok(CreateChecked {
        owner: req.user_id.unwrap_or(actor.user_id),
        client_ip,
        keepalive: keepalive(req.persistent_keepalive).unwrap_or(0),
        keypair,
    })
}

fn check_update(patch: &UpdatePeerRequest) -> Result<UpdateChecked> {
    let mut errs = FieldErrors::validate(patch);
    let client_ip = parse_client_ip(&mut errs, patch.client_ip.as_deref());
    if let Some(allowed_ips) = &patch.allowed_ips {
        errs.cidr_list("allowed_ips", allowed_ips);
    }
    if let Some(dns) = &patch.dns {
        errs.dns_list("dns", dns);
    }
    if let Some(endpoint) = &patch.endpoint {
        errs.endpoint("endpoint", endpoint);
    }
    errs.finish()?;
    let keepalive = keepalive(patch.persistent_keepalive);

    let keypair = patch
        .private_key
        .as_deref()
        .map(keys::keypair_from_private)
        .transpose()?;

    Ok(UpdateChecked {
        client_ip,
        keepalive,
        keypair,
    })
}

fn pool_containing(pools: &[IpPool], ip: Ipv4Addr) -> Result<Uuid> {
    pools
        .iter()
        .find(|pool| pool.cidr.contains(ip))
        .map(|pool| pool.id)
        .ok_or(ProvisionError::Alloc(AllocError::NoMatchingPool(ip)))
}

/// An explicit pool wins; otherwise the pool holding the requested address.
fn resolve_pool(pools: &[IpPool], pool_id: Option<Uuid>, client_ip: Option<Ipv4Addr>) -> Result<Uuid> {
    match (pool_id, client_ip) {
        (Some(id), _) => Ok(id),
        (None, Some(ip)) => pool_containing(pools, ip),
        (None, None) => Err(FieldErrors::single("ip_pool_id", "required").into()),
    }
}

fn trimmed(value: &str) -> String {
    value.trim().to_string()
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

impl<S: Store, A: Applier> Provisioner<S, A> {
    pub async fn create_peer(
        self: &Arc<Self>,
        actor: Actor,
        req: CreatePeerRequest,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        let mut created = self.create(actor, vec![req], false, cancel).await?;
        created
            .pop()
            .ok_or_else(|| ProvisionError::Internal("create produced no peer".into()))
    }

    pub async fn create_peers(
        self: &Arc<Self>,
        actor: Actor,
        reqs: Vec<CreatePeerRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        check_batch(reqs.len())?;
        self.create(actor, reqs, true, cancel).await
    }

    #[tracing::instrument(skip(self, reqs, cancel), fields(user_id = %actor.user_id, count = reqs.len()))]
    async fn create(
        self: &Arc<Self>,
        actor: Actor,
        reqs: Vec<CreatePeerRequest>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        let mut items = Vec::with_capacity(reqs.len());
        for (index, req) in reqs.into_iter().enumerate() {
            let checked = check_create(&actor, &req).map_err(at_index(index, batch))?;
            self.authorize(&actor, Resource::WgPeer, Some(checked.owner), Action::Create)
                .map_err(at_index(index, batch))?;
            items.push((req, checked));
        }

        self.exclusive(cancel, move |this| async move {
            let server = this.require_server().await?;
            let pools = this.store.list_pools().await?;
            let mut alloc = IpAllocator::new(server.host_ip());
            let now = Utc::now();

            let mut peers = Vec::with_capacity(items.len());
            for (index, (req, checked)) in items.into_iter().enumerate() {
                let peer = this
                    .build_peer(&mut alloc, &pools, req, checked, now)
                    .await
                    .map_err(at_index(index, batch))?;
                peers.push(peer);
            }

            this.store.insert_peers(&peers).await?;
            for peer in &peers {
                info!(peer_id = %peer.id, client_ip = ?peer.client_ip, "created peer");
            }

            let effects = Publish {
                write_clients: peers.iter().map(|p| p.id).collect(),
                server: true,
                ..Publish::default()
            };
            this.publish("create_peer", effects).await?;
            Ok(peers)
        })
        .await
    }

    async fn build_peer(
        &self,
        alloc: &mut IpAllocator,
        pools: &[IpPool],
        req: CreatePeerRequest,
        checked: CreateChecked,
        now: DateTime<Utc>,
    ) -> Result<Peer> {
        let owner = self
            .store
            .get_user(checked.owner)
            .await?
            .ok_or(ProvisionError::UserNotFound)?;
        if !owner.is_active() {
            return Err(ProvisionError::UserInactive);
        }

        let pool_id = resolve_pool(pools, req.ip_pool_id, checked.client_ip)?;
        self.track_pool(alloc, pool_id).await?;
        let ip = alloc.reserve(pool_id, checked.client_ip)?;

        let keypair = match checked.keypair {
            Some(keypair) => keypair,
            None => keys::generate_keypair()?,
        };

        Ok(Peer {
            id: Uuid::new_v4(),
            user_id: owner.id,
            device_name: trimmed(&req.device_name),
            private_key: keypair.private_key,
            public_key: keypair.public_key,
            client_ip: Some(ip),
            allowed_ips: trimmed(&req.allowed_ips),
            dns: trimmed(&req.dns),
            endpoint: trimmed(&req.endpoint),
            persistent_keepalive: checked.keepalive,
            status: PeerStatus::Active,
            ip_pool_id: Some(pool_id),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn update_peer(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        patch: UpdatePeerRequest,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        let item = BatchUpdatePeerItem { id, patch };
        let mut updated = self.update(actor, vec![item], false, cancel).await?;
        updated
            .pop()
            .ok_or_else(|| ProvisionError::Internal("update produced no peer".into()))
    }

    pub async fn update_peers(
        self: &Arc<Self>,
        actor: Actor,
        items: Vec<BatchUpdatePeerItem>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        check_batch(items.len())?;
        self.update(actor, items, true, cancel).await
    }

    #[tracing::instrument(skip(self, items, cancel), fields(user_id = %actor.user_id, count = items.len()))]
    async fn update(
        self: &Arc<Self>,
        actor: Actor,
        items: Vec<BatchUpdatePeerItem>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        let mut seen = HashSet::new();
        let mut checked = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if !seen.insert(item.id) {
                let dup = FieldErrors::single("id", "unique");
                return Err(at_index(index, batch)(dup.into()));
            }
            let parsed = check_update(&item.patch).map_err(at_index(index, batch))?;
            checked.push((item, parsed));
        }

        self.exclusive(cancel, move |this| async move {
            let server = this.require_server().await?;
            let pools = this.store.list_pools().await?;
            let mut alloc = IpAllocator::new(server.host_ip());
            let mut effects = Publish {
                server: true,
                ..Publish::default()
            };

            let mut peers = Vec::with_capacity(checked.len());
            for (index, (item, parsed)) in checked.into_iter().enumerate() {
                let peer = this
                    .patch_peer(&actor, &mut alloc, &pools, item, parsed, &mut effects)
                    .await
                    .map_err(at_index(index, batch))?;
                peers.push(peer);
            }

            this.store.update_peers(&peers).await?;
            for peer in &peers {
                info!(peer_id = %peer.id, status = %peer.status, client_ip = ?peer.client_ip, "updated peer");
            }

            this.publish("update_peer", effects).await?;
            Ok(peers)
        })
        .await
    }

    async fn patch_peer(
        &self,
        actor: &Actor,
        alloc: &mut IpAllocator,
        pools: &[IpPool],
        item: BatchUpdatePeerItem,
        checked: UpdateChecked,
        effects: &mut Publish,
    ) -> Result<Peer> {
        let BatchUpdatePeerItem { id, patch } = item;
        let mut peer = self
            .store
            .get_peer(id)
            .await?
            .ok_or(ProvisionError::PeerNotFound)?;

        self.authorize(actor, Resource::WgPeer, Some(peer.user_id), Action::Update)?;
        let new_owner = patch.user_id.filter(|owner| *owner != peer.user_id);
        let new_status = patch.status.filter(|status| *status != peer.status);
        if checked.keypair.is_some() || new_owner.is_some() || new_status.is_some() {
            self.authorize(actor, Resource::WgPeer, Some(peer.user_id), Action::UpdateSensitive)?;
        }

        let old_owner = self
            .store
            .get_user(peer.user_id)
            .await?
            .ok_or(ProvisionError::UserNotFound)?;

        if let Some(owner_id) = new_owner {
            self.authorize(actor, Resource::WgPeer, Some(owner_id), Action::UpdateSensitive)?;
            let owner = self
                .store
                .get_user(owner_id)
                .await?
                .ok_or(ProvisionError::UserNotFound)?;
            if !owner.is_active() {
                return Err(ProvisionError::UserInactive);
            }
            peer.user_id = owner.id;
            effects.remove_peer_dirs.push((old_owner.username.clone(), id));
        }

        if let Some(name) = &patch.device_name {
            peer.device_name = trimmed(name);
        }
        if let Some(allowed_ips) = &patch.allowed_ips {
            peer.allowed_ips = trimmed(allowed_ips);
        }
        if let Some(dns) = &patch.dns {
            peer.dns = trimmed(dns);
        }
        if let Some(endpoint) = &patch.endpoint {
            peer.endpoint = trimmed(endpoint);
        }
        if let Some(keepalive) = checked.keepalive {
            peer.persistent_keepalive = keepalive;
        }
        if let Some(keypair) = checked.keypair {
            peer.private_key = keypair.private_key;
            peer.public_key = keypair.public_key;
        }

        let status = patch.status.unwrap_or(peer.status);
        match status {
            PeerStatus::Disabled => {
                self.release_address(alloc, &mut peer).await?;
                if let Some(pool_id) = patch.ip_pool_id {
                    self.store
                        .get_pool(pool_id)
                        .await?
                        .ok_or(ProvisionError::PoolNotFound)?;
                    peer.ip_pool_id = Some(pool_id);
                }
                if new_owner.is_none() {
                    effects.remove_peer_dirs.push((old_owner.username, id));
                }
            }
            PeerStatus::Active => {
                let pool_changed = patch.ip_pool_id.is_some_and(|p| Some(p) != peer.ip_pool_id);
                let ip_changed = checked.client_ip.is_some_and(|ip| Some(ip) != peer.client_ip);
                if peer.client_ip.is_none() || pool_changed || ip_changed {
                    let pool_id = match (patch.ip_pool_id, checked.client_ip, peer.ip_pool_id) {
                        (Some(id), _, _) => id,
                        (None, Some(ip), _) => pool_containing(pools, ip)?,
                        (None, None, Some(id)) => id,
                        (None, None, None) => {
                            return Err(FieldErrors::single("ip_pool_id", "required").into());
                        }
                    };
                    self.release_address(alloc, &mut peer).await?;
                    self.track_pool(alloc, pool_id).await?;
                    peer.client_ip = Some(alloc.reserve(pool_id, checked.client_ip)?);
                    peer.ip_pool_id = Some(pool_id);
                }
                effects.write_clients.push(id);
            }
        }

        peer.status = status;
        peer.updated_at = Utc::now();
        Ok(peer)
    }

    /// Drops the peer's address from the working set; the pool link stays.
    async fn release_address(&self, alloc: &mut IpAllocator, peer: &mut Peer) -> Result<()> {
        if let (Some(ip), Some(pool_id)) = (peer.client_ip, peer.ip_pool_id) {
            self.track_pool(alloc, pool_id).await?;
            alloc.release(pool_id, ip);
        }
        peer.client_ip = None;
        Ok(())
    }

    #[tracing::instrument(skip(self, cancel), fields(user_id = %actor.user_id))]
    pub async fn rotate(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        self.exclusive(cancel, move |this| async move {
            let mut peer = this
                .store
                .get_peer(id)
                .await?
                .ok_or(ProvisionError::PeerNotFound)?;
            this.authorize(&actor, Resource::WgConfig, Some(peer.user_id), Action::Rotate)?;

            let keypair = keys::generate_keypair()?;
            peer.private_key = keypair.private_key;
            peer.public_key = keypair.public_key;
            peer.updated_at = Utc::now();
            this.store.update_peers(std::slice::from_ref(&peer)).await?;
            info!(peer_id = %id, public_key = %peer.public_key, "rotated peer keys");

            let mut effects = Publish::default();
            if peer.is_active() {
                effects.write_clients.push(id);
                effects.server = true;
            } else {
                // Disabled peers keep no key material on disk.
                let owner = this
                    .store
                    .get_user(peer.user_id)
                    .await?
                    .ok_or(ProvisionError::UserNotFound)?;
                effects.remove_peer_dirs.push((owner.username, id));
            }
            this.publish("rotate", effects).await?;
            Ok(peer)
        })
        .await
    }

    /// Disables the peer, frees its address and removes its client files.
    /// Revoking a disabled peer is a no-op.
    #[tracing::instrument(skip(self, cancel), fields(user_id = %actor.user_id))]
    pub async fn revoke(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        self.exclusive(cancel, move |this| async move {
            let mut peer = this
                .store
                .get_peer(id)
                .await?
                .ok_or(ProvisionError::PeerNotFound)?;
            this.authorize(&actor, Resource::WgConfig, Some(peer.user_id), Action::Revoke)?;
            if !peer.is_active() {
                return Ok(peer);
            }

            let owner = this
                .store
                .get_user(peer.user_id)
                .await?
                .ok_or(ProvisionError::UserNotFound)?;
            peer.status = PeerStatus::Disabled;
            peer.client_ip = None;
            peer.updated_at = Utc::now();
            this.store.update_peers(std::slice::from_ref(&peer)).await?;
            info!(peer_id = %id, "revoked peer");

            let effects = Publish {
                remove_peer_dirs: vec![(owner.username, id)],
                server: true,
                ..Publish::default()
            };
            this.publish("revoke", effects).await?;
            Ok(peer)
        })
        .await
    }

    pub async fn delete_peer(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.delete(actor, vec![id], false, cancel).await
    }

    pub async fn delete_peers(
        self: &Arc<Self>,
        actor: Actor,
        ids: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_batch(ids.len())?;
        self.delete(actor, ids, true, cancel).await
    }

    /// Hard delete. Ids that no longer exist are skipped.
    #[tracing::instrument(skip(self, ids, cancel), fields(user_id = %actor.user_id, count = ids.len()))]
    async fn delete(
        self: &Arc<Self>,
        actor: Actor,
        ids: Vec<Uuid>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.exclusive(cancel, move |this| async move {
            let mut effects = Publish {
                server: true,
                ..Publish::default()
            };
            let mut doomed = Vec::new();
            for (index, id) in ids.into_iter().enumerate() {
                let Some(peer) = this.store.get_peer(id).await? else {
                    this.authorize(&actor, Resource::WgPeer, None, Action::Delete)
                        .map_err(at_index(index, batch))?;
                    continue;
                };
                this.authorize(&actor, Resource::WgPeer, Some(peer.user_id), Action::Delete)
                    .map_err(at_index(index, batch))?;
                let owner = this.store.get_user(peer.user_id).await?;
                if let Some(owner) = owner {
                    effects.remove_peer_dirs.push((owner.username, id));
                }
                doomed.push(id);
            }

            if doomed.is_empty() {
                return Ok(());
            }
            this.store.delete_peers(&doomed).await?;
            info!(count = doomed.len(), "deleted peers");
            this.publish("delete_peer", effects).await
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

impl<S: Store, A: Applier> Provisioner<S, A> {
    async fn find_peer(&self, id: Uuid) -> Result<Peer> {
        self.store
            .get_peer(id)
            .await?
            .ok_or(ProvisionError::PeerNotFound)
    }

    pub async fn get_peer(&self, actor: &Actor, id: Uuid) -> Result<Peer> {
        let peer = self.find_peer(id).await?;
        self.authorize(actor, Resource::WgPeer, Some(peer.user_id), Action::Read)?;
        Ok(peer)
    }

    pub async fn list_peers(&self, actor: &Actor, filter: &PeerFilter) -> Result<Vec<Peer>> {
        self.authorize(actor, Resource::WgPeer, filter.user_id, Action::List)?;
        Ok(self.store.list_peers(filter).await?)
    }

    pub async fn list_mine(&self, actor: &Actor) -> Result<Vec<Peer>> {
        self.authorize(actor, Resource::WgConfig, Some(actor.user_id), Action::Read)?;
        Ok(self.store.list_peers(&PeerFilter::owned_by(actor.user_id)).await?)
    }

    /// The rendered client file, as an admin inspects it.
    pub async fn peer_config(&self, actor: &Actor, id: Uuid) -> Result<(Peer, String)> {
        let peer = self.find_peer(id).await?;
        self.authorize(actor, Resource::WgPeer, Some(peer.user_id), Action::Read)?;
        let conf = self.render_client_for(&peer).await?;
        Ok((peer, conf))
    }

    /// The rendered client file, as its owner downloads it.
    pub async fn download(&self, actor: &Actor, id: Uuid) -> Result<(Peer, String)> {
        let peer = self.find_peer(id).await?;
        self.authorize(actor, Resource::WgConfig, Some(peer.user_id), Action::Download)?;
        let conf = self.render_client_for(&peer).await?;
        Ok((peer, conf))
    }

    async fn render_client_for(&self, peer: &Peer) -> Result<String> {
        if !peer.is_active() {
            return Err(ProvisionError::PeerDisabled);
        }
        let server = self.require_server().await?;
        let server_public_key = server.public_key()?;
        let pool = match peer.ip_pool_id {
            Some(id) => self.store.get_pool(id).await?,
            None => None,
        };
        let ctx = ClientContext {
            server: &server,
            server_public_key: &server_public_key,
            defaults: &self.defaults,
        };
        Ok(render::render_client(peer, pool.as_ref(), &ctx)?)
    }

    pub async fn available_ips(&self, actor: &Actor, pool_id: Uuid, limit: usize) -> Result<Vec<Ipv4Addr>> {
        self.authorize(actor, Resource::IpPool, None, Action::Read)?;
        let server = self.require_server().await?;
        let mut alloc = IpAllocator::new(server.host_ip());
        self.track_pool(&mut alloc, pool_id).await?;
        Ok(alloc.list_available(pool_id, limit.clamp(1, MAX_AVAILABLE))?)
    }
}
