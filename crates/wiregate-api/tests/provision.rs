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

mod common;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use wiregate_api::allocator::AllocError;
use wiregate_api::db::UserStore;
use wiregate_api::db::models::PeerFilter;
use wiregate_api::provision::ProvisionError;
use wiregate_types::api::{
    BatchUpdatePeerItem, ChangePasswordRequest, CreatePeerRequest, UpdatePeerRequest,
    UpdatePoolRequest, UpdateServerConfigRequest,
};
use wiregate_types::{PeerStatus, PoolStatus, UserStatus};

use common::{Harness, USER_PASSWORD, actor, line_value, peer_request};

fn ip(text: &str) -> Ipv4Addr {
    text.parse().unwrap()
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

// -- Peer lifecycle --

#[tokio::test]
async fn admin_create_picks_lowest_free_address() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    let req = CreatePeerRequest {
        ip_pool_id: Some(pool.id),
        ..peer_request("laptop")
    };
    let peer = h.engine.create_peer(h.admin(), req, &token()).await.unwrap();

    assert_eq!(peer.client_ip, Some(ip("100.100.100.2")));
    assert_eq!(peer.user_id, h.admin.id);
    assert_eq!(h.server_peer_ips(), vec![ip("100.100.100.2")]);
    assert_eq!(h.server_file().matches("[Peer]").count(), 1);
    assert!(h.client_conf("admin", peer.id).exists());
    assert_eq!(h.applier.calls(), 1);
}

#[tokio::test]
async fn taken_address_is_rejected_without_side_effects() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    h.pool("office", "100.100.100.0/24").await;

    let first = CreatePeerRequest {
        user_id: Some(alice.id),
        client_ip: Some("100.100.100.5".into()),
        ..peer_request("phone")
    };
    h.engine.create_peer(h.admin(), first, &token()).await.unwrap();
    let before = h.server_file();
    let calls = h.applier.calls();

    let second = CreatePeerRequest {
        user_id: Some(bob.id),
        client_ip: Some("100.100.100.5/32".into()),
        ..peer_request("phone")
    };
    let err = h.engine.create_peer(h.admin(), second, &token()).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Alloc(AllocError::InUse(addr)) if addr == ip("100.100.100.5")));
    assert_eq!(h.server_file(), before);
    assert_eq!(h.applier.calls(), calls);
    let bobs = h.engine.list_mine(&actor(&bob)).await.unwrap();
    assert!(bobs.is_empty());
}

#[tokio::test]
async fn rotation_replaces_keys_everywhere() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    let old_private = peer.private_key.clone();
    let old_public = peer.public_key.clone();

    let rotated = h.engine.rotate(actor(&alice), peer.id, &token()).await.unwrap();
    assert_ne!(rotated.public_key, old_public);
    assert_eq!(rotated.client_ip, peer.client_ip);

    let (_, conf) = h.engine.download(&actor(&alice), peer.id).await.unwrap();
    let private = line_value(&conf, "PrivateKey").unwrap();
    assert_ne!(private, old_private);
    assert_eq!(wiregate_api::keys::derive_public(private).unwrap(), rotated.public_key);

    let server = h.server_file();
    assert!(server.contains(&format!("PublicKey = {}", rotated.public_key)));
    assert!(!server.contains(&old_public));

    let dir = h.peer_dir("alice", peer.id);
    let on_disk = std::fs::read_to_string(dir.join("publickey")).unwrap();
    assert_eq!(on_disk, rotated.public_key);
}

#[tokio::test]
async fn revoked_address_is_reused() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    assert_eq!(peer.client_ip, Some(ip("100.100.100.2")));

    let revoked = h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();
    assert_eq!(revoked.status, PeerStatus::Disabled);
    assert_eq!(revoked.client_ip, None);
    assert_eq!(revoked.ip_pool_id, Some(pool.id));
    assert!(h.server_peer_ips().is_empty());
    assert!(!h.peer_dir("alice", peer.id).exists());

    let next = h.peer(&bob, "desktop", &pool).await;
    assert_eq!(next.client_ip, Some(ip("100.100.100.2")));
}

#[tokio::test]
async fn rotating_a_revoked_peer_keeps_no_keys_on_disk() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    let dir = h.peer_dir("alice", peer.id);
    assert!(dir.join("privatekey").exists());

    h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();
    assert!(!dir.exists());

    let rotated = h.engine.rotate(actor(&alice), peer.id, &token()).await.unwrap();
    assert_ne!(rotated.public_key, peer.public_key);
    assert_eq!(rotated.status, PeerStatus::Disabled);
    assert!(!dir.exists());
    assert!(!h.server_file().contains(&peer.public_key));
    assert!(!h.server_file().contains(&rotated.public_key));
}

#[tokio::test]
async fn disabling_through_update_removes_client_files() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    let patch = UpdatePeerRequest {
        status: Some(PeerStatus::Disabled),
        ..UpdatePeerRequest::default()
    };
    let disabled = h.engine.update_peer(h.admin(), peer.id, patch, &token()).await.unwrap();

    assert_eq!(disabled.client_ip, None);
    assert!(!h.peer_dir("alice", peer.id).exists());
    assert!(h.server_peer_ips().is_empty());
}

#[tokio::test]
async fn revoking_twice_is_a_no_op() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();
    let calls = h.applier.calls();
    let again = h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();

    assert_eq!(again.status, PeerStatus::Disabled);
    assert_eq!(h.applier.calls(), calls);
}

#[tokio::test]
async fn disabled_peer_cannot_be_downloaded() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();

    let err = h.engine.download(&actor(&alice), peer.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::PeerDisabled));
}

#[tokio::test]
async fn reactivation_allocates_a_fresh_address() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();
    h.peer(&bob, "desktop", &pool).await;

    let patch = UpdatePeerRequest {
        status: Some(PeerStatus::Active),
        ..UpdatePeerRequest::default()
    };
    let active = h.engine.update_peer(h.admin(), peer.id, patch, &token()).await.unwrap();

    assert_eq!(active.status, PeerStatus::Active);
    assert_eq!(active.client_ip, Some(ip("100.100.100.3")));
    assert!(h.client_conf("alice", peer.id).exists());
    assert_eq!(h.server_peer_ips(), vec![ip("100.100.100.2"), ip("100.100.100.3")]);
}

#[tokio::test]
async fn owner_cannot_reenable_their_own_peer() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap();

    let patch = UpdatePeerRequest {
        status: Some(PeerStatus::Active),
        ..UpdatePeerRequest::default()
    };
    let err = h
        .engine
        .update_peer(actor(&alice), peer.id, patch, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));
}

#[tokio::test]
async fn owner_can_rename_their_device() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    let patch = UpdatePeerRequest {
        device_name: Some("work laptop".into()),
        persistent_keepalive: Some(25),
        ..UpdatePeerRequest::default()
    };
    let updated = h.engine.update_peer(actor(&alice), peer.id, patch, &token()).await.unwrap();

    assert_eq!(updated.device_name, "work laptop");
    assert_eq!(updated.client_ip, peer.client_ip);
    assert!(h.server_file().contains("PersistentKeepalive = 25"));
    assert!(h.server_file().contains("work laptop"));
}

#[tokio::test]
async fn moving_a_peer_to_another_address() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    let patch = UpdatePeerRequest {
        client_ip: Some("100.100.100.50".into()),
        ..UpdatePeerRequest::default()
    };
    let moved = h.engine.update_peer(h.admin(), peer.id, patch, &token()).await.unwrap();
    assert_eq!(moved.client_ip, Some(ip("100.100.100.50")));

    let available = h.engine.available_ips(&h.admin(), pool.id, 2).await.unwrap();
    assert_eq!(available, vec![ip("100.100.100.2"), ip("100.100.100.3")]);
}

#[tokio::test]
async fn deleting_removes_files_and_is_idempotent() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    assert!(h.peer_dir("alice", peer.id).exists());

    h.engine.delete_peer(h.admin(), peer.id, &token()).await.unwrap();
    assert!(!h.peer_dir("alice", peer.id).exists());
    assert!(h.server_peer_ips().is_empty());

    h.engine.delete_peer(h.admin(), peer.id, &token()).await.unwrap();
    let err = h.engine.get_peer(&h.admin(), peer.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::PeerNotFound));
}

// -- Batches --

#[tokio::test]
async fn batch_with_one_bad_item_changes_nothing() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let before = h.server_file();

    let reqs = vec![
        CreatePeerRequest {
            ip_pool_id: Some(pool.id),
            ..peer_request("one")
        },
        CreatePeerRequest {
            client_ip: Some("10.9.9.9".into()),
            ..peer_request("two")
        },
        CreatePeerRequest {
            ip_pool_id: Some(pool.id),
            ..peer_request("three")
        },
    ];
    let err = h.engine.create_peers(h.admin(), reqs, &token()).await.unwrap_err();

    assert!(matches!(err, ProvisionError::BatchItem { index: 1, .. }));
    assert!(matches!(err.root(), ProvisionError::Alloc(AllocError::NoMatchingPool(_))));
    let peers = h.engine.list_peers(&h.admin(), &PeerFilter::default()).await.unwrap();
    assert!(peers.is_empty());
    assert_eq!(h.server_file(), before);
    assert!(!h.dir.path().join("users").exists());
    assert_eq!(h.applier.calls(), 0);
}

#[tokio::test]
async fn batch_picks_distinct_addresses_and_applies_once() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    let reqs = (0..3)
        .map(|i| CreatePeerRequest {
            ip_pool_id: Some(pool.id),
            ..peer_request(&format!("device-{i}"))
        })
        .collect();
    let peers = h.engine.create_peers(h.admin(), reqs, &token()).await.unwrap();

    let ips: Vec<_> = peers.iter().filter_map(|p| p.client_ip).collect();
    assert_eq!(ips, vec![ip("100.100.100.2"), ip("100.100.100.3"), ip("100.100.100.4")]);
    assert_eq!(h.applier.calls(), 1);
}

#[tokio::test]
async fn batch_update_rejects_repeated_ids() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let alice = h.user("alice").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    let item = BatchUpdatePeerItem {
        id: peer.id,
        patch: UpdatePeerRequest::default(),
    };
    let err = h
        .engine
        .update_peers(h.admin(), vec![item.clone(), item], &token())
        .await
        .unwrap_err();
    match err.root() {
        ProvisionError::Validation(errs) => assert_eq!(errs.get("id"), Some("validation.unique")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn empty_and_oversized_batches_are_rejected() {
    let h = Harness::new().await;
    let err = h.engine.create_peers(h.admin(), Vec::new(), &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::EmptyBatch));

    let ids = (0..51).map(|_| uuid::Uuid::new_v4()).collect();
    let err = h.engine.delete_peers(h.admin(), ids, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::BatchTooLarge));
}

// -- Authorization and cancellation --

#[tokio::test]
async fn users_cannot_create_peers_for_others() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    let req = CreatePeerRequest {
        user_id: Some(bob.id),
        ip_pool_id: Some(pool.id),
        ..peer_request("sneaky")
    };
    let err = h.engine.create_peer(actor(&alice), req, &token()).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Forbidden));
    assert_eq!(h.applier.calls(), 0);
    assert!(!h.server_path().exists());
}

#[tokio::test]
async fn users_cannot_touch_foreign_peers() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&bob, "laptop", &pool).await;

    let err = h.engine.rotate(actor(&alice), peer.id, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));
    let err = h.engine.download(&actor(&alice), peer.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));
    let err = h.engine.revoke(actor(&alice), peer.id, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));

    let unchanged = h.engine.get_peer(&h.admin(), peer.id).await.unwrap();
    assert_eq!(unchanged.public_key, peer.public_key);
    assert_eq!(unchanged.status, PeerStatus::Active);
}

#[tokio::test]
async fn users_cannot_manage_pools() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;

    let err = h
        .engine
        .create_pool(actor(&alice), common::pool_request("mine", "10.1.0.0/24"), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));
}

#[tokio::test]
async fn cancelled_request_changes_nothing() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let req = CreatePeerRequest {
        ip_pool_id: Some(pool.id),
        ..peer_request("laptop")
    };
    let err = h.engine.create_peer(h.admin(), req, &cancel).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Cancelled));
    let peers = h.engine.list_peers(&h.admin(), &PeerFilter::default()).await.unwrap();
    assert!(peers.is_empty());
}

#[tokio::test]
async fn apply_failure_keeps_database_state() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    h.applier.fail_next(true);
    let req = CreatePeerRequest {
        ip_pool_id: Some(pool.id),
        ..peer_request("laptop")
    };
    let err = h.engine.create_peer(h.admin(), req, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Apply(_)));

    let peers = h.engine.list_peers(&h.admin(), &PeerFilter::default()).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(h.server_peer_ips(), vec![ip("100.100.100.2")]);

    h.applier.fail_next(false);
    h.engine.reconcile_as(h.admin(), &token()).await.unwrap();
    assert_eq!(h.applier.calls(), 2);
}

#[tokio::test]
async fn dropped_request_still_finishes_its_critical_section() {
    let h = Harness::new().await;
    let pool_id = h.pool("office", "100.100.100.0/24").await.id;
    h.applier.hold(true);

    let cancel = CancellationToken::new();
    let engine = Arc::clone(&h.engine);
    let admin = h.admin();
    let request_cancel = cancel.clone();
    let request = tokio::spawn(async move {
        let req = CreatePeerRequest {
            ip_pool_id: Some(pool_id),
            ..peer_request("laptop")
        };
        engine.create_peer(admin, req, &request_cancel).await
    });

    h.applier.wait_entered().await;
    cancel.cancel();
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    h.applier.release();
    h.applier.wait_finished(1).await;

    let peers = h.engine.list_peers(&h.admin(), &PeerFilter::default()).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert!(h.client_conf("admin", peers[0].id).exists());
    assert_eq!(h.server_peer_ips(), vec![ip("100.100.100.2")]);
}

#[tokio::test]
async fn cancelled_while_waiting_for_the_lock() {
    let h = Harness::new().await;
    let pool_id = h.pool("office", "100.100.100.0/24").await.id;
    h.applier.hold(true);

    let engine = Arc::clone(&h.engine);
    let admin = h.admin();
    let first = tokio::spawn(async move {
        let req = CreatePeerRequest {
            ip_pool_id: Some(pool_id),
            ..peer_request("first")
        };
        engine.create_peer(admin, req, &CancellationToken::new()).await
    });
    h.applier.wait_entered().await;

    let cancel = CancellationToken::new();
    let engine = Arc::clone(&h.engine);
    let admin = h.admin();
    let waiting_cancel = cancel.clone();
    let second = tokio::spawn(async move {
        let req = CreatePeerRequest {
            ip_pool_id: Some(pool_id),
            ..peer_request("second")
        };
        engine.create_peer(admin, req, &waiting_cancel).await
    });
    tokio::task::yield_now().await;
    cancel.cancel();
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, ProvisionError::Cancelled));

    h.applier.release();
    first.await.unwrap().unwrap();

    let peers = h.engine.list_peers(&h.admin(), &PeerFilter::default()).await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].device_name, "first");
    assert_eq!(h.applier.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_get_distinct_addresses() {
    let h = Harness::new().await;
    let pool_id = h.pool("office", "100.100.100.0/24").await.id;

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let engine = Arc::clone(&h.engine);
            let admin = h.admin();
            tokio::spawn(async move {
                let req = CreatePeerRequest {
                    ip_pool_id: Some(pool_id),
                    ..peer_request(&format!("device-{i}"))
                };
                engine.create_peer(admin, req, &CancellationToken::new()).await
            })
        })
        .collect();

    let mut ips = HashSet::new();
    for task in tasks {
        let peer = task.await.unwrap().unwrap();
        assert!(ips.insert(peer.client_ip.unwrap()));
    }

    let expected: HashSet<_> = (2..42).map(|n| Ipv4Addr::new(100, 100, 100, n)).collect();
    assert_eq!(ips, expected);
    let on_disk: HashSet<_> = h.server_peer_ips().into_iter().collect();
    assert_eq!(on_disk, expected);
    assert_eq!(h.applier.calls(), 40);
}

// -- Pools --

#[tokio::test]
async fn pools_in_use_cannot_change_cidr_or_be_deleted() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    h.peer(&alice, "laptop", &pool).await;

    let patch = UpdatePoolRequest {
        cidr: Some("100.100.101.0/24".into()),
        ..UpdatePoolRequest::default()
    };
    let err = h.engine.update_pool(h.admin(), pool.id, patch, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::PoolInUse));

    let err = h.engine.delete_pool(h.admin(), pool.id, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::PoolInUse));
}

#[tokio::test]
async fn pool_dns_reaches_client_files() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    let calls = h.applier.calls();

    let patch = UpdatePoolRequest {
        dns: Some("9.9.9.9".into()),
        ..UpdatePoolRequest::default()
    };
    h.engine.update_pool(h.admin(), pool.id, patch, &token()).await.unwrap();

    let conf = std::fs::read_to_string(h.client_conf("alice", peer.id)).unwrap();
    assert_eq!(line_value(&conf, "DNS"), Some("9.9.9.9"));
    assert_eq!(h.applier.calls(), calls);
}

#[tokio::test]
async fn disabled_pool_refuses_new_peers() {
    let h = Harness::new().await;
    let pool = h.pool("office", "100.100.100.0/24").await;

    let patch = UpdatePoolRequest {
        status: Some(PoolStatus::Disabled),
        ..UpdatePoolRequest::default()
    };
    h.engine.update_pool(h.admin(), pool.id, patch, &token()).await.unwrap();

    let req = CreatePeerRequest {
        ip_pool_id: Some(pool.id),
        ..peer_request("laptop")
    };
    let err = h.engine.create_peer(h.admin(), req, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Alloc(AllocError::PoolDisabled)));
}

#[tokio::test]
async fn available_addresses_skip_reserved_ones() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    h.peer(&alice, "laptop", &pool).await;

    let free = h.engine.available_ips(&h.admin(), pool.id, 3).await.unwrap();
    assert_eq!(free, vec![ip("100.100.100.3"), ip("100.100.100.4"), ip("100.100.100.5")]);

    let all = h.engine.available_ips(&h.admin(), pool.id, 10_000).await.unwrap();
    assert_eq!(all.len(), 252);
}

// -- Server configuration --

#[tokio::test]
async fn server_update_rewrites_and_applies() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;
    let calls = h.applier.calls();

    let req = UpdateServerConfigRequest {
        listen_port: Some(51900),
        ..UpdateServerConfigRequest::default()
    };
    let server = h.engine.update_server(h.admin(), req, &token()).await.unwrap();

    assert_eq!(server.listen_port, 51900);
    assert!(h.server_file().contains("ListenPort = 51900"));
    let conf = std::fs::read_to_string(h.client_conf("alice", peer.id)).unwrap();
    assert_eq!(line_value(&conf, "Endpoint"), Some("vpn.example.com:51900"));
    assert_eq!(h.applier.calls(), calls + 1);
}

#[tokio::test]
async fn server_cannot_take_a_peer_address() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    h.peer(&alice, "laptop", &pool).await;

    let req = UpdateServerConfigRequest {
        address: Some("100.100.100.2/24".into()),
        ..UpdateServerConfigRequest::default()
    };
    let err = h.engine.update_server(h.admin(), req, &token()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Alloc(AllocError::ServerAddress(_))));
}

// -- Accounts --

#[tokio::test]
async fn users_cannot_change_each_others_passwords() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let bob = h.user("bob").await;

    let req = ChangePasswordRequest {
        old_password: Some(USER_PASSWORD.into()),
        new_password: "hijacked-password".into(),
    };
    let err = h
        .engine
        .change_password(&actor(&alice), "bob", req)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Forbidden));

    let stored = h.store.get_user(bob.id).await.unwrap().unwrap();
    assert_eq!(stored.password_hash, bob.password_hash);
    h.engine.login("bob", USER_PASSWORD).await.unwrap();
}

#[tokio::test]
async fn self_removal_is_soft() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    h.engine.remove_user(actor(&alice), "alice", &token()).await.unwrap();

    let stored = h.store.get_user(alice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, UserStatus::Deleted);
    let peer = h.engine.get_peer(&h.admin(), peer.id).await.unwrap();
    assert_eq!(peer.status, PeerStatus::Disabled);
    assert!(h.server_peer_ips().is_empty());
    assert!(!h.peer_dir("alice", peer.id).exists());
    assert!(matches!(
        h.engine.login("alice", USER_PASSWORD).await,
        Err(ProvisionError::UserInactive)
    ));
}

#[tokio::test]
async fn admin_removal_is_hard() {
    let h = Harness::new().await;
    let alice = h.user("alice").await;
    let pool = h.pool("office", "100.100.100.0/24").await;
    let peer = h.peer(&alice, "laptop", &pool).await;

    h.engine.remove_user(h.admin(), "alice", &token()).await.unwrap();

    assert!(h.store.get_user(alice.id).await.unwrap().is_none());
    assert!(!h.dir.path().join("users").join("alice").exists());
    let err = h.engine.get_peer(&h.admin(), peer.id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::PeerNotFound));
}

// -- Invariants --

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn active_addresses_stay_unique(ops in proptest::collection::vec(0u8..3, 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let h = Harness::new().await;
            let pool = h.pool("small", "100.100.100.0/28").await;
            let mut live = Vec::new();

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    1 if !live.is_empty() => {
                        let id = live.remove(0);
                        h.engine.revoke(h.admin(), id, &token()).await.unwrap();
                    }
                    2 if !live.is_empty() => {
                        let id = live.pop().unwrap();
                        h.engine.delete_peer(h.admin(), id, &token()).await.unwrap();
                    }
                    _ => {
                        let req = CreatePeerRequest {
                            ip_pool_id: Some(pool.id),
                            ..peer_request(&format!("d{i}"))
                        };
                        match h.engine.create_peer(h.admin(), req, &token()).await {
                            Ok(peer) => live.push(peer.id),
                            Err(ProvisionError::Alloc(AllocError::Exhausted(_))) => {
                                assert_eq!(live.len(), 13);
                            }
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                }
            }

            let filter = PeerFilter {
                status: Some(PeerStatus::Active),
                ..PeerFilter::default()
            };
            let active = h.engine.list_peers(&h.admin(), &filter).await.unwrap();
            let ips: Vec<Ipv4Addr> = active.iter().filter_map(|p| p.client_ip).collect();
            let unique: HashSet<_> = ips.iter().copied().collect();

            assert_eq!(ips.len(), live.len());
            assert_eq!(unique.len(), ips.len());
            for addr in &ips {
                assert!(pool.cidr.contains(*addr));
                assert_ne!(*addr, ip("100.100.100.0"));
                assert_ne!(*addr, ip("100.100.100.1"));
                assert_ne!(*addr, ip("100.100.100.15"));
            }

            let mut on_disk = h.server_peer_ips();
            let mut expected = ips.clone();
            on_disk.sort();
            expected.sort();
            assert_eq!(on_disk, expected);
        });
    }
}
