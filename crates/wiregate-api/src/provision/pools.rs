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
use std::sync::Arc;

use chrono::Utc;
use ipnetwork::Ipv4Network;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;
use wiregate_types::api::{BatchUpdatePoolItem, CreatePoolRequest, UpdatePoolRequest};
use wiregate_types::{PeerStatus, PoolStatus};

use super::{Provisioner, ProvisionError, Publish, Result, at_index, check_batch};
use crate::allocator::AddressSpace;
use crate::apply::Applier;
use crate::db::Store;
use crate::db::models::{IpPool, PeerFilter};
use crate::policy::{Action, Actor, Resource};
use crate::validate::FieldErrors;

/// Parses a pool CIDR and normalizes it to its network address, so
/// `10.0.0.7/24` is stored as `10.0.0.0/24`.
fn check_cidr(errs: &mut FieldErrors, value: &str) -> Result<Option<Ipv4Network>> {
    let Some(net) = errs.ipv4_cidr("cidr", value) else {
        return Ok(None);
    };
    let normalized = Ipv4Network::new(net.network(), net.prefix())
        .map_err(|e| ProvisionError::Internal(e.to_string()))?;
    AddressSpace::new(normalized)?;
    Ok(Some(normalized))
}

fn check_details(
    errs: &mut FieldErrors,
    routes: Option<&str>,
    dns: Option<&str>,
    endpoint: Option<&str>,
) {
    if let Some(routes) = routes {
        errs.cidr_list("routes", routes);
    }
    if let Some(dns) = dns {
        errs.dns_list("dns", dns);
    }
    if let Some(endpoint) = endpoint {
        errs.endpoint("endpoint", endpoint);
    }
}

fn check_create(req: &CreatePoolRequest) -> Result<Ipv4Network> {
    let mut errs = FieldErrors::validate(req);
    let cidr = check_cidr(&mut errs, &req.cidr)?;
    check_details(
        &mut errs,
        Some(&req.routes),
        Some(&req.dns),
        Some(&req.endpoint),
    );
    errs.finish()?;
    cidr.ok_or_else(|| FieldErrors::single("cidr", "cidrv4").into())
}

fn check_update(patch: &UpdatePoolRequest) -> Result<Option<Ipv4Network>> {
    let mut errs = FieldErrors::validate(patch);
    let cidr = match &patch.cidr {
        Some(cidr) => check_cidr(&mut errs, cidr)?,
        None => None,
    };
    check_details(
        &mut errs,
        patch.routes.as_deref(),
        patch.dns.as_deref(),
        patch.endpoint.as_deref(),
    );
    errs.finish()?;
    Ok(cidr)
}

impl<S: Store, A: Applier> Provisioner<S, A> {
    pub async fn get_pool(&self, actor: &Actor, id: Uuid) -> Result<IpPool> {
        self.authorize(actor, Resource::IpPool, None, Action::Read)?;
        self.store
            .get_pool(id)
            .await?
            .ok_or(ProvisionError::PoolNotFound)
    }

    pub async fn list_pools(&self, actor: &Actor) -> Result<Vec<IpPool>> {
        self.authorize(actor, Resource::IpPool, None, Action::List)?;
        Ok(self.store.list_pools().await?)
    }

    pub async fn create_pool(
        self: &Arc<Self>,
        actor: Actor,
        req: CreatePoolRequest,
        cancel: &CancellationToken,
    ) -> Result<IpPool> {
        let mut created = self.insert_pools(actor, vec![req], false, cancel).await?;
        created
            .pop()
            .ok_or_else(|| ProvisionError::Internal("create produced no pool".into()))
    }

    pub async fn create_pools(
        self: &Arc<Self>,
        actor: Actor,
        reqs: Vec<CreatePoolRequest>,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpPool>> {
        check_batch(reqs.len())?;
        self.insert_pools(actor, reqs, true, cancel).await
    }

    #[tracing::instrument(skip(self, reqs, cancel), fields(count = reqs.len()))]
    async fn insert_pools(
        self: &Arc<Self>,
        actor: Actor,
        reqs: Vec<CreatePoolRequest>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpPool>> {
        self.authorize(&actor, Resource::IpPool, None, Action::Create)?;

        let now = Utc::now();
        let mut pools = Vec::with_capacity(reqs.len());
        for (index, req) in reqs.into_iter().enumerate() {
            let cidr = check_create(&req).map_err(at_index(index, batch))?;
            pools.push(IpPool {
                id: Uuid::new_v4(),
                name: req.name.trim().to_string(),
                cidr,
                routes: req.routes.trim().to_string(),
                dns: req.dns.trim().to_string(),
                endpoint: req.endpoint.trim().to_string(),
                description: req.description,
                status: req.status.unwrap_or(PoolStatus::Active),
                created_at: now,
                updated_at: now,
            });
        }

        self.exclusive(cancel, move |this| async move {
            this.store.insert_pools(&pools).await?;
            for pool in &pools {
                info!(pool_id = %pool.id, cidr = %pool.cidr, "created ip pool");
            }
            Ok(pools)
        })
        .await
    }

    pub async fn update_pool(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        patch: UpdatePoolRequest,
        cancel: &CancellationToken,
    ) -> Result<IpPool> {
        let item = BatchUpdatePoolItem { id, patch };
        let mut updated = self.patch_pools(actor, vec![item], false, cancel).await?;
        updated
            .pop()
            .ok_or_else(|| ProvisionError::Internal("update produced no pool".into()))
    }

    pub async fn update_pools(
        self: &Arc<Self>,
        actor: Actor,
        items: Vec<BatchUpdatePoolItem>,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpPool>> {
        check_batch(items.len())?;
        self.patch_pools(actor, items, true, cancel).await
    }

    /// Pool details feed client files only, so affected clients are
    /// re-rendered but the interface is left alone.
    #[tracing::instrument(skip(self, items, cancel), fields(count = items.len()))]
    async fn patch_pools(
        self: &Arc<Self>,
        actor: Actor,
        items: Vec<BatchUpdatePoolItem>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IpPool>> {
        self.authorize(&actor, Resource::IpPool, None, Action::Update)?;

        let mut seen = HashSet::new();
        let mut checked = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if !seen.insert(item.id) {
                return Err(at_index(index, batch)(FieldErrors::single("id", "unique").into()));
            }
            let cidr = check_update(&item.patch).map_err(at_index(index, batch))?;
            checked.push((item, cidr));
        }

        self.exclusive(cancel, move |this| async move {
            let now = Utc::now();
            let mut pools = Vec::with_capacity(checked.len());
            for (index, (BatchUpdatePoolItem { id, patch }, cidr)) in checked.into_iter().enumerate() {
                let tag = || at_index(index, batch);
                let mut pool = this
                    .store
                    .get_pool(id)
                    .await?
                    .ok_or(ProvisionError::PoolNotFound)
                    .map_err(tag())?;

                if let Some(cidr) = cidr.filter(|cidr| *cidr != pool.cidr) {
                    if this.store.pool_in_use(id).await? {
                        return Err(tag()(ProvisionError::PoolInUse));
                    }
                    pool.cidr = cidr;
                }
                if let Some(name) = patch.name {
                    pool.name = name.trim().to_string();
                }
                if let Some(routes) = patch.routes {
                    pool.routes = routes.trim().to_string();
                }
                if let Some(dns) = patch.dns {
                    pool.dns = dns.trim().to_string();
                }
                if let Some(endpoint) = patch.endpoint {
                    pool.endpoint = endpoint.trim().to_string();
                }
                if let Some(description) = patch.description {
                    pool.description = description;
                }
                if let Some(status) = patch.status {
                    pool.status = status;
                }
                pool.updated_at = now;
                pools.push(pool);
            }

            this.store.update_pools(&pools).await?;

            let mut effects = Publish::default();
            for pool in &pools {
                info!(pool_id = %pool.id, "updated ip pool");
                let filter = PeerFilter {
                    ip_pool_id: Some(pool.id),
                    status: Some(PeerStatus::Active),
                    ..PeerFilter::default()
                };
                let peers = this.store.list_peers(&filter).await?;
                effects.write_clients.extend(peers.iter().map(|p| p.id));
            }
            this.publish("update_pool", effects).await?;
            Ok(pools)
        })
        .await
    }

    pub async fn delete_pool(
        self: &Arc<Self>,
        actor: Actor,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.remove_pools(actor, vec![id], false, cancel).await
    }

    pub async fn delete_pools(
        self: &Arc<Self>,
        actor: Actor,
        ids: Vec<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_batch(ids.len())?;
        self.remove_pools(actor, ids, true, cancel).await
    }

    /// Pools still referenced by any peer are refused. Missing ids are skipped.
    #[tracing::instrument(skip(self, ids, cancel), fields(count = ids.len()))]
    async fn remove_pools(
        self: &Arc<Self>,
        actor: Actor,
        ids: Vec<Uuid>,
        batch: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.authorize(&actor, Resource::IpPool, None, Action::Delete)?;

        self.exclusive(cancel, move |this| async move {
            let mut doomed = Vec::with_capacity(ids.len());
            for (index, id) in ids.into_iter().enumerate() {
                if this.store.get_pool(id).await?.is_none() {
                    continue;
                }
                if this.store.pool_in_use(id).await? {
                    return Err(at_index(index, batch)(ProvisionError::PoolInUse));
                }
                doomed.push(id);
            }
            if doomed.is_empty() {
                return Ok(());
            }
            this.store.delete_pools(&doomed).await?;
            info!(count = doomed.len(), "deleted ip pools");
            Ok(())
        })
        .await
    }
}
