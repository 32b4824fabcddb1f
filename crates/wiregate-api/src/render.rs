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

//! wg-quick file rendering and the atomic writer for everything on disk.

use std::fmt::Write as _;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::db::models::{IpPool, Peer, PeerWithOwner, ServerConfig};

pub const DEFAULT_ALLOWED_IPS: &str = "0.0.0.0/0, ::/0";

const PRIVATE_MODE: u32 = 0o600;
const PUBLIC_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to write {path}: {source}", path = path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove {path}: {source}", path = path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("peer {0} holds no address")]
    NoAddress(Uuid),

    #[error("refusing unsafe path component {0:?}")]
    UnsafePath(String),
}

type Result<T> = std::result::Result<T, RenderError>;

/// Operator-wide client defaults, the last stop before the hard defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientDefaults {
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub allowed_ips: String,
    #[serde(default)]
    pub endpoint: String,
}

fn first_set<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

// ---------------------------------------------------------------------------
// Server file
// ---------------------------------------------------------------------------

/// Renders the server `[Interface]` and one `[Peer]` per active peer, ordered
/// by address so unrelated changes leave the file byte-identical.
pub fn render_server(server: &ServerConfig, peers: &[PeerWithOwner]) -> String {
    let mut out = String::new();
    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "Address = {}", server.address).unwrap();
    writeln!(out, "ListenPort = {}", server.listen_port).unwrap();
    writeln!(out, "PrivateKey = {}", server.private_key).unwrap();
    if server.mtu != 0 {
        writeln!(out, "MTU = {}", server.mtu).unwrap();
    }
    if !server.post_up.trim().is_empty() {
        writeln!(out, "PostUp = {}", server.post_up.trim()).unwrap();
    }
    if !server.post_down.trim().is_empty() {
        writeln!(out, "PostDown = {}", server.post_down.trim()).unwrap();
    }

    let mut active: Vec<_> = peers
        .iter()
        .filter(|p| p.peer.is_active())
        .filter_map(|p| p.peer.client_ip.map(|ip| (u32::from(ip), p)))
        .collect();
    active.sort_by_key(|(ip, _)| *ip);

    for (_, entry) in active {
        let peer = &entry.peer;
        writeln!(out).unwrap();
        writeln!(out, "# {} {} {}", peer.id, entry.username, peer.device_name).unwrap();
        writeln!(out, "[Peer]").unwrap();
        writeln!(out, "PublicKey = {}", peer.public_key).unwrap();
        if let Some(ip) = peer.client_ip {
            writeln!(out, "AllowedIPs = {ip}/32").unwrap();
        }
        if peer.persistent_keepalive != 0 {
            writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive).unwrap();
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Client file
// ---------------------------------------------------------------------------

pub struct ClientContext<'a> {
    pub server: &'a ServerConfig,
    pub server_public_key: &'a str,
    pub defaults: &'a ClientDefaults,
}

pub fn render_client(peer: &Peer, pool: Option<&IpPool>, ctx: &ClientContext<'_>) -> Result<String> {
    let ip = peer.client_ip.ok_or(RenderError::NoAddress(peer.id))?;
    let pool_dns = pool.map_or("", |p| p.dns.as_str());
    let pool_endpoint = pool.map_or("", |p| p.endpoint.as_str());
    let pool_routes = pool.map_or("", |p| p.routes.as_str());
    let server_endpoint = ctx.server.endpoint().unwrap_or_default();

    let dns = first_set([
        peer.dns.as_str(),
        pool_dns,
        ctx.server.dns.as_str(),
        ctx.defaults.dns.as_str(),
    ]);
    let endpoint = first_set([
        peer.endpoint.as_str(),
        pool_endpoint,
        server_endpoint.as_str(),
        ctx.defaults.endpoint.as_str(),
    ]);
    let allowed_ips = first_set([
        peer.allowed_ips.as_str(),
        pool_routes,
        ctx.defaults.allowed_ips.as_str(),
    ])
    .unwrap_or(DEFAULT_ALLOWED_IPS);

    let mut out = String::new();
    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "PrivateKey = {}", peer.private_key).unwrap();
    writeln!(out, "Address = {ip}/32").unwrap();
    if let Some(dns) = dns {
        writeln!(out, "DNS = {dns}").unwrap();
    }
    writeln!(out).unwrap();
    writeln!(out, "[Peer]").unwrap();
    writeln!(out, "PublicKey = {}", ctx.server_public_key).unwrap();
    if let Some(endpoint) = endpoint {
        writeln!(out, "Endpoint = {endpoint}").unwrap();
    }
    writeln!(out, "AllowedIPs = {allowed_ips}").unwrap();
    if peer.persistent_keepalive != 0 {
        writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive).unwrap();
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn containing_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

async fn replace_file(path: &Path, tmp: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_MODE)
        .open(tmp)
        .await?;
    file.set_permissions(std::fs::Permissions::from_mode(PRIVATE_MODE))
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if mode != PRIVATE_MODE {
        tokio::fs::set_permissions(tmp, std::fs::Permissions::from_mode(mode)).await?;
    }
    tokio::fs::rename(tmp, path).await?;
    tokio::fs::File::open(containing_dir(path))
        .await?
        .sync_all()
        .await
}

/// Replaces `path` via `<path>.tmp`, fsync and rename; readers see either the
/// old or the new content, never a prefix.
#[tracing::instrument(skip(contents), fields(len = contents.len()))]
pub async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let tmp = tmp_path(path);
    match replace_file(path, &tmp, contents, mode).await {
        Ok(()) => Ok(()),
        Err(source) => {
            match tokio::fs::remove_file(&tmp).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
                }
                _ => {}
            }
            Err(RenderError::Write {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

async fn remove_dir_ignoring_absent(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(RenderError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

fn safe_component(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(RenderError::UnsafePath(name.to_string()));
    }
    Ok(name)
}

/// The on-disk layout: one server file plus
/// `<user_dir>/<username>/<peer_id>/{<peer_id>.conf, privatekey, publickey}`.
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    server_path: PathBuf,
    user_dir: PathBuf,
}

impl ConfigFiles {
    pub fn new(server_path: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
            user_dir: user_dir.into(),
        }
    }

    pub fn server_path(&self) -> &Path {
        &self.server_path
    }

    pub fn user_path(&self, username: &str) -> Result<PathBuf> {
        Ok(self.user_dir.join(safe_component(username)?))
    }

    pub fn peer_path(&self, username: &str, peer_id: Uuid) -> Result<PathBuf> {
        Ok(self.user_path(username)?.join(peer_id.to_string()))
    }

    pub async fn write_server(&self, contents: &str) -> Result<()> {
        let dir = containing_dir(&self.server_path);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| RenderError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        write_atomic(&self.server_path, contents.as_bytes(), PRIVATE_MODE).await
    }

    #[tracing::instrument(skip(self, peer, conf), fields(peer_id = %peer.id))]
    pub async fn write_client(&self, username: &str, peer: &Peer, conf: &str) -> Result<()> {
        let dir = self.peer_path(username, peer.id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| RenderError::Write {
                path: dir.clone(),
                source,
            })?;

        let conf_path = dir.join(format!("{}.conf", peer.id));
        write_atomic(&conf_path, conf.as_bytes(), PRIVATE_MODE).await?;
        write_atomic(&dir.join("privatekey"), peer.private_key.as_bytes(), PRIVATE_MODE).await?;
        write_atomic(&dir.join("publickey"), peer.public_key.as_bytes(), PUBLIC_MODE).await
    }

    pub async fn remove_peer_dir(&self, username: &str, peer_id: Uuid) -> Result<()> {
        remove_dir_ignoring_absent(&self.peer_path(username, peer_id)?).await
    }

    pub async fn remove_user_dir(&self, username: &str) -> Result<()> {
        remove_dir_ignoring_absent(&self.user_path(username)?).await
    }
}
