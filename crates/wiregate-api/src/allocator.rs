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

//! Client address allocation inside IPv4 pools.
//!
//! Addresses are handled as `u32`. [`AddressSpace`] holds the pure rules for
//! a single CIDR; [`IpAllocator`] is the working set of one critical section:
//! the provisioner loads each pool's current reservations from the store once,
//! then reserves and releases against it so that several picks inside one
//! batch never collide with each other.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("{0} is outside the pool")]
    OutOfRange(Ipv4Addr),

    #[error("{0} is the pool's network address")]
    NetworkAddress(Ipv4Addr),

    #[error("{0} is the pool's broadcast address")]
    BroadcastAddress(Ipv4Addr),

    #[error("{0} is the server's tunnel address")]
    ServerAddress(Ipv4Addr),

    #[error("{0} is already in use")]
    InUse(Ipv4Addr),

    #[error("no free address left in {0}")]
    Exhausted(Ipv4Network),

    #[error("prefix /{0} leaves no usable client address")]
    PrefixTooSmall(u8),

    #[error("pool is disabled")]
    PoolDisabled,

    #[error("{0} is not inside any pool")]
    NoMatchingPool(Ipv4Addr),

    #[error("pool {0} was not loaded into the allocator")]
    UnknownPool(Uuid),
}

type Result<T> = std::result::Result<T, AllocError>;

/// Parses `a.b.c.d` or `a.b.c.d/32`.
pub fn parse_host(text: &str) -> Option<Ipv4Addr> {
    let text = text.trim();
    match text.split_once('/') {
        Some((ip, "32")) => ip.parse().ok(),
        Some(_) => None,
        None => text.parse().ok(),
    }
}

pub fn host_cidr(ip: Ipv4Addr) -> String {
    format!("{ip}/32")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    cidr: Ipv4Network,
    network: u32,
    broadcast: u32,
}

impl AddressSpace {
    pub fn new(cidr: Ipv4Network) -> Result<Self> {
        if cidr.prefix() >= 31 {
            return Err(AllocError::PrefixTooSmall(cidr.prefix()));
        }
        Ok(Self {
            cidr,
            network: u32::from(cidr.network()),
            broadcast: u32::from(cidr.broadcast()),
        })
    }

    pub fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let n = u32::from(ip);
        n >= self.network && n <= self.broadcast
    }

    /// Applies every reservation rule to `ip`, in the order callers see them.
    pub fn check(&self, ip: Ipv4Addr, server: Ipv4Addr, taken: &BTreeSet<u32>) -> Result<()> {
        let n = u32::from(ip);
        if !self.contains(ip) {
            return Err(AllocError::OutOfRange(ip));
        }
        if n == self.network {
            return Err(AllocError::NetworkAddress(ip));
        }
        if n == self.broadcast {
            return Err(AllocError::BroadcastAddress(ip));
        }
        if ip == server {
            return Err(AllocError::ServerAddress(ip));
        }
        if taken.contains(&n) {
            return Err(AllocError::InUse(ip));
        }
        Ok(())
    }

    /// Free addresses in ascending order, starting at `network + 1`.
    pub fn free<'a>(
        &'a self,
        server: Ipv4Addr,
        taken: &'a BTreeSet<u32>,
    ) -> impl Iterator<Item = Ipv4Addr> + 'a {
        let server = u32::from(server);
        (self.network + 1..self.broadcast)
            .filter(move |n| *n != server && !taken.contains(n))
            .map(Ipv4Addr::from)
    }

    pub fn lowest_free(&self, server: Ipv4Addr, taken: &BTreeSet<u32>) -> Result<Ipv4Addr> {
        self.free(server, taken)
            .next()
            .ok_or(AllocError::Exhausted(self.cidr))
    }
}

#[derive(Debug)]
struct TrackedPool {
    space: AddressSpace,
    active: bool,
    taken: BTreeSet<u32>,
}

#[derive(Debug)]
pub struct IpAllocator {
    server_ip: Ipv4Addr,
    pools: HashMap<Uuid, TrackedPool>,
}

impl IpAllocator {
    pub fn new(server_ip: Ipv4Addr) -> Self {
        Self {
            server_ip,
            pools: HashMap::new(),
        }
    }

    pub fn is_loaded(&self, pool_id: Uuid) -> bool {
        self.pools.contains_key(&pool_id)
    }

    /// Registers a pool and the addresses currently reserved in it.
    pub fn load(
        &mut self,
        pool_id: Uuid,
        cidr: Ipv4Network,
        active: bool,
        taken: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Result<()> {
        let space = AddressSpace::new(cidr)?;
        let taken = taken.into_iter().map(u32::from).collect();
        self.pools.insert(
            pool_id,
            TrackedPool {
                space,
                active,
                taken,
            },
        );
        Ok(())
    }

    fn pool(&self, pool_id: Uuid) -> Result<&TrackedPool> {
        self.pools.get(&pool_id).ok_or(AllocError::UnknownPool(pool_id))
    }

    #[tracing::instrument(skip(self))]
    pub fn reserve(&mut self, pool_id: Uuid, preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        let server = self.server_ip;
        let pool = self
            .pools
            .get_mut(&pool_id)
            .ok_or(AllocError::UnknownPool(pool_id))?;
        if !pool.active {
            return Err(AllocError::PoolDisabled);
        }

        let ip = match preferred {
            Some(ip) => {
                pool.space.check(ip, server, &pool.taken)?;
                ip
            }
            None => pool.space.lowest_free(server, &pool.taken)?,
        };
        pool.taken.insert(u32::from(ip));
        tracing::debug!(%ip, "reserved address");
        Ok(ip)
    }

    /// Idempotent.
    pub fn release(&mut self, pool_id: Uuid, ip: Ipv4Addr) {
        if let Some(pool) = self.pools.get_mut(&pool_id) {
            pool.taken.remove(&u32::from(ip));
        }
    }

    pub fn list_available(&self, pool_id: Uuid, limit: usize) -> Result<Vec<Ipv4Addr>> {
        let pool = self.pool(pool_id)?;
        Ok(pool
            .space
            .free(self.server_ip, &pool.taken)
            .take(limit)
            .collect())
    }
}
