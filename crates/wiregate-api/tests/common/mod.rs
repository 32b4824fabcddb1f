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

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wiregate_api::apply::{Applier, ApplyError};
use wiregate_api::db::MemoryStore;
use wiregate_api::db::models::{IpPool, Peer, User};
use wiregate_api::policy::{Actor, Policy};
use wiregate_api::provision::{BootstrapAdmin, BootstrapServer, Provisioner};
use wiregate_api::render::{ClientDefaults, ConfigFiles};
use wiregate_types::api::{CreatePeerRequest, CreatePoolRequest, CreateUserRequest};

pub const ADMIN_PASSWORD: &str = "admin-password";
pub const USER_PASSWORD: &str = "user-password";

// -- Applier that records calls --

#[derive(Clone, Default)]
pub struct RecordingApplier {
    calls: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl RecordingApplier {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Applies that ran to completion.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// While held, each apply blocks until [`Self::release`] is called.
    pub fn hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub async fn wait_finished(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.finished() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("apply did not finish");
    }
}

impl Applier for RecordingApplier {
    async fn apply(&self) -> Result<(), ApplyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ApplyError::Failed {
                program: "wg".into(),
                status: "exit status: 1".into(),
                stderr: "interface is down".into(),
            });
        }
        Ok(())
    }
}

pub type Engine = Provisioner<MemoryStore, RecordingApplier>;

// -- Harness --

/// An engine over an in-memory store, writing files into a temp directory.
/// The server tunnel is `100.100.100.1/24` and an admin account exists.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub applier: RecordingApplier,
    pub dir: TempDir,
    pub admin: User,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let applier = RecordingApplier::default();
        let files = ConfigFiles::new(dir.path().join("wg0.conf"), dir.path().join("users"));
        let engine = Arc::new(Provisioner::new(
            Arc::clone(&store),
            applier.clone(),
            Arc::new(Policy::load_embedded().unwrap()),
            files,
            ClientDefaults::default(),
        ));

        engine
            .bootstrap_server(&BootstrapServer::default(), Some("vpn.example.com".into()))
            .await
            .unwrap();
        let admin = engine
            .bootstrap_admin(&BootstrapAdmin {
                username: "admin".into(),
                email: "admin@example.com".into(),
                password: ADMIN_PASSWORD.into(),
            })
            .await
            .unwrap()
            .unwrap();

        Self {
            engine,
            store,
            applier,
            dir,
            admin,
        }
    }

    pub fn admin(&self) -> Actor {
        actor(&self.admin)
    }

    pub async fn user(&self, username: &str) -> User {
        self.engine
            .register(
                None,
                CreateUserRequest {
                    username: username.into(),
                    email: format!("{username}@example.com"),
                    password: USER_PASSWORD.into(),
                    nickname: String::new(),
                    avatar: String::new(),
                    role: None,
                    status: None,
                },
            )
            .await
            .unwrap()
    }

    pub async fn pool(&self, name: &str, cidr: &str) -> IpPool {
        self.engine
            .create_pool(self.admin(), pool_request(name, cidr), &CancellationToken::new())
            .await
            .unwrap()
    }

    pub async fn peer(&self, owner: &User, device: &str, pool: &IpPool) -> Peer {
        let req = CreatePeerRequest {
            user_id: Some(owner.id),
            ip_pool_id: Some(pool.id),
            ..peer_request(device)
        };
        self.engine
            .create_peer(self.admin(), req, &CancellationToken::new())
            .await
            .unwrap()
    }

    pub fn server_path(&self) -> PathBuf {
        self.dir.path().join("wg0.conf")
    }

    pub fn server_file(&self) -> String {
        std::fs::read_to_string(self.server_path()).unwrap_or_default()
    }

    pub fn client_conf(&self, username: &str, peer_id: Uuid) -> PathBuf {
        self.dir
            .path()
            .join("users")
            .join(username)
            .join(peer_id.to_string())
            .join(format!("{peer_id}.conf"))
    }

    pub fn peer_dir(&self, username: &str, peer_id: Uuid) -> PathBuf {
        self.dir.path().join("users").join(username).join(peer_id.to_string())
    }

    /// Addresses of the `[Peer]` blocks in the server file, in file order.
    pub fn server_peer_ips(&self) -> Vec<Ipv4Addr> {
        self.server_file()
            .lines()
            .filter_map(|line| line.strip_prefix("AllowedIPs = "))
            .filter_map(|cidr| cidr.strip_suffix("/32"))
            .map(|ip| ip.parse().unwrap())
            .collect()
    }
}

pub fn actor(user: &User) -> Actor {
    Actor {
        user_id: user.id,
        role: user.role,
    }
}

pub fn pool_request(name: &str, cidr: &str) -> CreatePoolRequest {
    CreatePoolRequest {
        name: name.into(),
        cidr: cidr.into(),
        routes: String::new(),
        dns: String::new(),
        endpoint: String::new(),
        description: String::new(),
        status: None,
    }
}

pub fn peer_request(device: &str) -> CreatePeerRequest {
    CreatePeerRequest {
        device_name: device.into(),
        ..CreatePeerRequest::default()
    }
}

pub fn line_value<'a>(conf: &'a str, key: &str) -> Option<&'a str> {
    conf.lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(" = "))
}
