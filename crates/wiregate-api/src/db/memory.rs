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

//! Process-local store with the same constraints as the Postgres schema.
//!
//! Every write is applied to a copy of the state, the copy is checked against
//! all uniqueness and reference constraints, and only then swapped in, which
//! gives each call the all-or-nothing behaviour of a transaction.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;
use wiregate_types::{PeerStatus, UserStatus};

use super::models::{IpPool, Peer, PeerFilter, PeerWithOwner, ServerConfig, User};
use super::{Result, StoreError, UserStore, WgStore};

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<Uuid, User>,
    pools: HashMap<Uuid, IpPool>,
    peers: HashMap<Uuid, Peer>,
    server: Option<ServerConfig>,
}

impl State {
    fn check(&self) -> Result<()> {
        let mut usernames = HashSet::new();
        let mut emails = HashSet::new();
        for user in self.users.values() {
            if !usernames.insert(user.username.as_str()) {
                return Err(StoreError::DuplicateUsername);
            }
            if !emails.insert(user.email.as_str()) {
                return Err(StoreError::DuplicateEmail);
            }
        }

        let pools: Vec<&IpPool> = self.pools.values().collect();
        let mut names = HashSet::new();
        for (i, pool) in pools.iter().enumerate() {
            if !names.insert(pool.name.as_str()) {
                return Err(StoreError::DuplicatePoolName);
            }
            let overlaps = pools[i + 1..].iter().any(|other| {
                pool.cidr.contains(other.cidr.network()) || other.cidr.contains(pool.cidr.network())
            });
            if overlaps {
                return Err(StoreError::DuplicatePoolCidr);
            }
        }

        let mut public_keys = HashSet::new();
        let mut devices = HashSet::new();
        let mut addresses = HashSet::new();
        for peer in self.peers.values() {
            if !public_keys.insert(peer.public_key.as_str()) {
                return Err(StoreError::DuplicatePublicKey);
            }
            if !devices.insert((peer.user_id, peer.device_name.as_str())) {
                return Err(StoreError::DuplicateDeviceName);
            }
            if peer.client_ip.is_some_and(|ip| !addresses.insert(ip)) {
                return Err(StoreError::AddressInUse);
            }
            if !self.users.contains_key(&peer.user_id) {
                return Err(StoreError::Corrupt(format!("peer {} has no owner", peer.id)));
            }
            if peer.ip_pool_id.is_some_and(|id| !self.pools.contains_key(&id)) {
                return Err(StoreError::PoolInUse);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.check()?;
        *guard = next;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&*self.state.lock().await)
    }
}

impl UserStore for MemoryStore {
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.read(|s| s.users.is_empty()).await)
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        self.write(|s| {
            s.users.insert(user.id, user.clone());
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.read(|s| s.users.get(&id).cloned()).await)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .read(|s| s.users.values().find(|u| u.username == username).cloned())
            .await)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self
            .read(|s| {
                s.users
                    .values()
                    .filter(|u| u.status != UserStatus::Deleted)
                    .cloned()
                    .collect()
            })
            .await;
        users.sort_by_key(|u| (u.created_at, u.id));
        Ok(users)
    }

    async fn update_user(&self, user: &User) -> Result<User> {
        self.write(|s| {
            let slot = s
                .users
                .get_mut(&user.id)
                .ok_or_else(|| StoreError::Database(sqlx::Error::RowNotFound))?;
            *slot = User {
                updated_at: Utc::now(),
                ..user.clone()
            };
            Ok(slot.clone())
        })
        .await
    }

    async fn retire_user(&self, id: Uuid, hard: bool) -> Result<()> {
        self.write(|s| {
            if hard {
                s.users.remove(&id);
                s.peers.retain(|_, p| p.user_id != id);
                return Ok(());
            }
            let now = Utc::now();
            if let Some(user) = s.users.get_mut(&id) {
                user.status = UserStatus::Deleted;
                user.updated_at = now;
            }
            for peer in s.peers.values_mut().filter(|p| p.user_id == id) {
                peer.status = PeerStatus::Disabled;
                peer.client_ip = None;
                peer.updated_at = now;
            }
            Ok(())
        })
        .await
    }
}

impl WgStore for MemoryStore {
    async fn get_server(&self) -> Result<Option<ServerConfig>> {
        Ok(self.read(|s| s.server.clone()).await)
    }

    async fn save_server(&self, server: &ServerConfig) -> Result<()> {
        self.write(|s| {
            s.server = Some(server.clone());
            Ok(())
        })
        .await
    }

    async fn insert_pools(&self, pools: &[IpPool]) -> Result<()> {
        self.write(|s| {
            for pool in pools {
                s.pools.insert(pool.id, pool.clone());
            }
            Ok(())
        })
        .await
    }

    async fn get_pool(&self, id: Uuid) -> Result<Option<IpPool>> {
        Ok(self.read(|s| s.pools.get(&id).cloned()).await)
    }

    async fn list_pools(&self) -> Result<Vec<IpPool>> {
        let mut pools: Vec<IpPool> = self.read(|s| s.pools.values().cloned().collect()).await;
        pools.sort_by_key(|p| (u32::from(p.cidr.network()), p.cidr.prefix()));
        Ok(pools)
    }

    async fn update_pools(&self, pools: &[IpPool]) -> Result<()> {
        self.write(|s| {
            for pool in pools {
                if let Some(slot) = s.pools.get_mut(&pool.id) {
                    *slot = pool.clone();
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete_pools(&self, ids: &[Uuid]) -> Result<()> {
        self.write(|s| {
            for id in ids {
                s.pools.remove(id);
            }
            Ok(())
        })
        .await
    }

    async fn pool_in_use(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .read(|s| s.peers.values().any(|p| p.ip_pool_id == Some(id)))
            .await)
    }

    async fn allocated_addresses(&self, pool_id: Uuid) -> Result<Vec<Ipv4Addr>> {
        let mut ips: Vec<Ipv4Addr> = self
            .read(|s| {
                s.peers
                    .values()
                    .filter(|p| p.ip_pool_id == Some(pool_id))
                    .filter_map(|p| p.client_ip)
                    .collect()
            })
            .await;
        ips.sort();
        Ok(ips)
    }

    async fn insert_peers(&self, peers: &[Peer]) -> Result<()> {
        self.write(|s| {
            for peer in peers {
                s.peers.insert(peer.id, peer.clone());
            }
            Ok(())
        })
        .await
    }

    async fn get_peer(&self, id: Uuid) -> Result<Option<Peer>> {
        Ok(self.read(|s| s.peers.get(&id).cloned()).await)
    }

    async fn list_peers(&self, filter: &PeerFilter) -> Result<Vec<Peer>> {
        let mut peers: Vec<Peer> = self
            .read(|s| s.peers.values().filter(|p| filter.matches(p)).cloned().collect())
            .await;
        peers.sort_by_key(|p| (p.created_at, p.id));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(peers.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_active_peers(&self) -> Result<Vec<PeerWithOwner>> {
        let mut peers: Vec<PeerWithOwner> = self
            .read(|s| {
                s.peers
                    .values()
                    .filter(|p| p.is_active() && p.client_ip.is_some())
                    .filter_map(|p| {
                        let owner = s.users.get(&p.user_id)?;
                        Some(PeerWithOwner {
                            peer: p.clone(),
                            username: owner.username.clone(),
                        })
                    })
                    .collect()
            })
            .await;
        peers.sort_by_key(|p| p.peer.client_ip);
        Ok(peers)
    }

    async fn update_peers(&self, peers: &[Peer]) -> Result<()> {
        self.write(|s| {
            for peer in peers {
                if let Some(slot) = s.peers.get_mut(&peer.id) {
                    *slot = peer.clone();
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete_peers(&self, ids: &[Uuid]) -> Result<()> {
        self.write(|s| {
            for id in ids {
                s.peers.remove(id);
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiregate_types::{PoolStatus, Role};

    fn user(name: &str) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: name.into(),
            nickname: String::new(),
            avatar: String::new(),
            email: format!("{name}@example.com"),
            password_hash: "x".into(),
            role: Role::User,
            status: UserStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn pool(name: &str, cidr: &str) -> IpPool {
        let now = Utc::now();
        IpPool {
            id: Uuid::new_v4(),
            name: name.into(),
            cidr: cidr.parse().unwrap(),
            routes: String::new(),
            dns: String::new(),
            endpoint: String::new(),
            description: String::new(),
            status: PoolStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn peer(owner: &User, pool: &IpPool, device: &str, ip: &str, key: &str) -> Peer {
        let now = Utc::now();
        Peer {
            id: Uuid::new_v4(),
            user_id: owner.id,
            device_name: device.into(),
            private_key: String::new(),
            public_key: key.into(),
            client_ip: Some(ip.parse().unwrap()),
            allowed_ips: String::new(),
            dns: String::new(),
            endpoint: String::new(),
            persistent_keepalive: 0,
            status: PeerStatus::Active,
            ip_pool_id: Some(pool.id),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = MemoryStore::new();
        store.create_user(&user("alice")).await.unwrap();
        let mut again = user("alice");
        again.email = "other@example.com".into();
        assert!(matches!(
            store.create_user(&again).await,
            Err(StoreError::DuplicateUsername)
        ));
    }

    #[tokio::test]
    async fn overlapping_pools_rejected() {
        let store = MemoryStore::new();
        store.insert_pools(&[pool("a", "10.0.0.0/16")]).await.unwrap();
        let err = store
            .insert_pools(&[pool("b", "10.0.5.0/24")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePoolCidr));
    }

    #[tokio::test]
    async fn failed_batch_leaves_state_untouched() {
        let store = MemoryStore::new();
        let alice = user("alice");
        let p = pool("main", "100.100.100.0/24");
        store.create_user(&alice).await.unwrap();
        store.insert_pools(std::slice::from_ref(&p)).await.unwrap();

        let a = peer(&alice, &p, "laptop", "100.100.100.2", "k1");
        let b = peer(&alice, &p, "phone", "100.100.100.2", "k2");
        let err = store.insert_peers(&[a, b]).await.unwrap_err();
        assert!(matches!(err, StoreError::AddressInUse));
        assert!(store.list_peers(&PeerFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn referenced_pool_cannot_be_deleted() {
        let store = MemoryStore::new();
        let alice = user("alice");
        let p = pool("main", "100.100.100.0/24");
        store.create_user(&alice).await.unwrap();
        store.insert_pools(std::slice::from_ref(&p)).await.unwrap();
        store
            .insert_peers(&[peer(&alice, &p, "laptop", "100.100.100.2", "k1")])
            .await
            .unwrap();

        assert!(store.pool_in_use(p.id).await.unwrap());
        assert!(matches!(store.delete_pools(&[p.id]).await, Err(StoreError::PoolInUse)));
    }

    #[tokio::test]
    async fn soft_retire_disables_peers_and_frees_addresses() {
        let store = MemoryStore::new();
        let alice = user("alice");
        let p = pool("main", "100.100.100.0/24");
        store.create_user(&alice).await.unwrap();
        store.insert_pools(std::slice::from_ref(&p)).await.unwrap();
        store
            .insert_peers(&[peer(&alice, &p, "laptop", "100.100.100.2", "k1")])
            .await
            .unwrap();

        store.retire_user(alice.id, false).await.unwrap();

        assert!(store.allocated_addresses(p.id).await.unwrap().is_empty());
        assert!(store.list_active_peers().await.unwrap().is_empty());
        assert!(store.list_users().await.unwrap().is_empty());
        let kept = store.get_user(alice.id).await.unwrap().unwrap();
        assert_eq!(kept.status, UserStatus::Deleted);
    }

    #[tokio::test]
    async fn list_peers_filters_and_pages() {
        let store = MemoryStore::new();
        let alice = user("alice");
        let bob = user("bob");
        let p = pool("main", "100.100.100.0/24");
        store.create_user(&alice).await.unwrap();
        store.create_user(&bob).await.unwrap();
        store.insert_pools(std::slice::from_ref(&p)).await.unwrap();
        store
            .insert_peers(&[
                peer(&alice, &p, "a1", "100.100.100.2", "k1"),
                peer(&alice, &p, "a2", "100.100.100.3", "k2"),
                peer(&bob, &p, "b1", "100.100.100.4", "k3"),
            ])
            .await
            .unwrap();

        let mine = store.list_peers(&PeerFilter::owned_by(alice.id)).await.unwrap();
        assert_eq!(mine.len(), 2);

        let page = PeerFilter {
            limit: Some(1),
            offset: Some(1),
            ..PeerFilter::default()
        };
        assert_eq!(store.list_peers(&page).await.unwrap().len(), 1);
    }
}
