mod common;

use common::{ChannelTransport, StubGarlic, StubTunnelPool, inbound_tunnel};
use rust_garlic::config::NetdbConfig;
use rust_garlic::gzip::{deflate_gzip, inflate_gzip};
use rust_garlic::i2np::{
    self, I2NP_DATABASE_LOOKUP, I2NP_DATABASE_SEARCH_REPLY, I2NP_DATABASE_STORE, Message,
    StoreContent,
};
use rust_garlic::identity::{IdentHash, PrivateIdentity};
use rust_garlic::netdb::store::NetdbStore;
use rust_garlic::netdb::types::{
    LeaseSet, ROUTER_FLAG_FLOODFILL, build_router_record,
};
use rust_garlic::netdb::{LocalRouter, NetdbEngine, NetdbHandle};
use rust_garlic::tunnel::{TunnelDelivery, TunnelMessageBlock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Net {
    handle: NetdbHandle,
    store: Arc<NetdbStore>,
    transport_rx: mpsc::UnboundedReceiver<(IdentHash, Message)>,
    tunnel_rx: mpsc::UnboundedReceiver<TunnelMessageBlock>,
    _dir: tempfile::TempDir,
}

async fn spawn_netdb(num_floodfills: usize) -> Net {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(NetdbStore::new());
    for _ in 0..num_floodfills {
        let keys = PrivateIdentity::generate();
        store
            .add_router(&build_router_record(
                keys.identity(),
                rust_garlic::util::now_ms(),
                ROUTER_FLAG_FLOODFILL,
            ))
            .unwrap();
    }

    let local = Arc::new(LocalRouter::new(PrivateIdentity::generate(), false));
    let (transport, transport_rx) = ChannelTransport::new();
    let (pool, tunnel_rx, _drop) =
        StubTunnelPool::new(vec![inbound_tunnel(IdentHash([0xEE; 32]), 5)], &[9]);

    let (engine, handle) = NetdbEngine::new(
        store.clone(),
        local,
        transport,
        pool,
        Arc::new(StubGarlic),
        dir.path().join("netDb"),
        NetdbConfig::default(),
        None,
    );
    tokio::spawn(engine.run());

    Net {
        handle,
        store,
        transport_rx,
        tunnel_rx,
        _dir: dir,
    }
}

/// Next direct message of the wanted type about `target`, skipping
/// publish/explore noise.
async fn next_direct(
    rx: &mut mpsc::UnboundedReceiver<(IdentHash, Message)>,
    msg_type: u8,
    target: &IdentHash,
) -> (IdentHash, Message) {
    timeout(Duration::from_secs(5), async {
        loop {
            let (to, msg) = rx.recv().await.expect("transport closed");
            if msg.msg_type != msg_type {
                continue;
            }
            let matches = match msg_type {
                I2NP_DATABASE_LOOKUP => {
                    i2np::decode_database_lookup(&msg.payload).is_ok_and(|l| l.target == *target)
                }
                I2NP_DATABASE_STORE => {
                    i2np::decode_database_store(&msg.payload).is_ok_and(|s| s.key == *target)
                }
                I2NP_DATABASE_SEARCH_REPLY => i2np::decode_database_search_reply(&msg.payload)
                    .is_ok_and(|r| r.key == *target),
                _ => true,
            };
            if matches {
                return (to, msg);
            }
        }
    })
    .await
    .expect("expected direct message")
}

/// Next tunneled DatabaseLookup block for `target`.
async fn next_tunneled_lookup(
    rx: &mut mpsc::UnboundedReceiver<TunnelMessageBlock>,
    target: &IdentHash,
) -> i2np::DatabaseLookup {
    timeout(Duration::from_secs(5), async {
        loop {
            let block = rx.recv().await.expect("tunnel sink closed");
            let TunnelDelivery::Router { .. } = block.delivery else {
                continue;
            };
            if block.message.first() != Some(&I2NP_DATABASE_LOOKUP) {
                continue;
            }
            if let Ok(lookup) = i2np::decode_database_lookup(&block.message[1..])
                && lookup.target == *target
            {
                return lookup;
            }
        }
    })
    .await
    .expect("expected tunneled lookup")
}

// S6: every floodfill answers with an unhelpful search reply; after the
// seventh exclusion the lookup fails and the waiter gets nothing.
#[tokio::test]
async fn lookup_fails_after_seven_floodfills() {
    let mut net = spawn_netdb(8).await;
    let target = IdentHash([0x77; 32]);

    let waiter = {
        let handle = net.handle.clone();
        tokio::spawn(async move { handle.request_destination(target).await })
    };

    // First attempt goes directly to the closest floodfill.
    let (_, msg) = next_direct(&mut net.transport_rx, I2NP_DATABASE_LOOKUP, &target).await;
    let first = i2np::decode_database_lookup(&msg.payload).unwrap();
    assert_eq!(first.target, target);

    for round in 0u8..7 {
        let candidate = IdentHash([0xC0 + round; 32]);
        net.handle.post_message(Message::direct(
            I2NP_DATABASE_SEARCH_REPLY,
            i2np::encode_database_search_reply(&target, &[candidate]),
        ));
        if round < 6 {
            let retry = next_tunneled_lookup(&mut net.tunnel_rx, &target).await;
            // Every retry excludes everything tried before it.
            assert_eq!(retry.excluded.len(), round as usize + 1);
        }
    }

    let result = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("lookup must resolve")
        .unwrap();
    assert!(result.is_none(), "exhausted lookup resolves with nothing");
}

// A DatabaseStore for a pending destination resolves the lookup.
#[tokio::test]
async fn database_store_resolves_pending_lookup() {
    let mut net = spawn_netdb(3).await;
    let wanted = PrivateIdentity::generate();
    let record = build_router_record(wanted.identity(), rust_garlic::util::now_ms(), 0);
    let target = wanted.hash();

    let waiter = {
        let handle = net.handle.clone();
        tokio::spawn(async move { handle.request_destination(target).await })
    };
    next_direct(&mut net.transport_rx, I2NP_DATABASE_LOOKUP, &target).await;

    net.handle.post_message(Message::direct(
        I2NP_DATABASE_STORE,
        i2np::encode_database_store_router(&target, &deflate_gzip(&record).unwrap()),
    ));

    let result = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("lookup must resolve")
        .unwrap()
        .expect("record expected");
    assert_eq!(result.hash(), target);
    assert!(net.store.find_router(&target).is_some());
}

// DatabaseLookup resolution order: router record, lease set, then a
// search reply naming the closest floodfills.
#[tokio::test]
async fn lookups_are_answered_in_preference_order() {
    let mut net = spawn_netdb(5).await;
    let asker = IdentHash([0x0A; 32]);

    // Known router record.
    let known = PrivateIdentity::generate();
    let record = build_router_record(known.identity(), rust_garlic::util::now_ms(), 0);
    net.store.add_router(&record).unwrap();
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&known.hash(), &asker, None, &[]),
    ));
    let (to, msg) = next_direct(&mut net.transport_rx, I2NP_DATABASE_STORE, &known.hash()).await;
    assert_eq!(to, asker);
    let store_msg = i2np::decode_database_store(&msg.payload).unwrap();
    match store_msg.content {
        StoreContent::Router { deflated } => {
            assert_eq!(inflate_gzip(&deflated, 2048).unwrap(), record);
        }
        other => panic!("expected router record, got {other:?}"),
    }

    // Known lease set.
    let dest = PrivateIdentity::generate();
    let ls = LeaseSet::build(*dest.identity(), vec![]);
    net.store
        .add_leaseset(dest.hash(), ls.buffer(), None)
        .unwrap();
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&dest.hash(), &asker, None, &[]),
    ));
    let (_, msg) = next_direct(&mut net.transport_rx, I2NP_DATABASE_STORE, &dest.hash()).await;
    let store_msg = i2np::decode_database_store(&msg.payload).unwrap();
    assert!(matches!(store_msg.content, StoreContent::LeaseSet { .. }));

    // Unknown key: closest floodfills come back in a search reply.
    let unknown = IdentHash([0x55; 32]);
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&unknown, &asker, None, &[]),
    ));
    let (_, msg) =
        next_direct(&mut net.transport_rx, I2NP_DATABASE_SEARCH_REPLY, &unknown).await;
    let reply = i2np::decode_database_search_reply(&msg.payload).unwrap();
    assert_eq!(reply.peers.len(), 3);
}

// A lookup asking for a tunnel reply is answered through an exploratory
// outbound tunnel toward the requested gateway.
#[tokio::test]
async fn tunnel_replies_ride_an_outbound_tunnel() {
    let mut net = spawn_netdb(4).await;
    let asker = IdentHash([0x0B; 32]);
    let unknown = IdentHash([0x56; 32]);

    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&unknown, &asker, Some(4242), &[]),
    ));

    let block = timeout(Duration::from_secs(5), async {
        loop {
            let block = net.tunnel_rx.recv().await.expect("tunnel sink closed");
            if let TunnelDelivery::Tunnel { gateway, tunnel_id } = block.delivery
                && gateway == asker
            {
                assert_eq!(tunnel_id, 4242);
                return block;
            }
        }
    })
    .await
    .expect("expected tunneled reply");

    assert_eq!(block.message.first(), Some(&I2NP_DATABASE_SEARCH_REPLY));
    let reply = i2np::decode_database_search_reply(&block.message[1..]).unwrap();
    assert_eq!(reply.key, unknown);
}

// Lease sets arriving through a tunnel are never stored.
#[tokio::test]
async fn tunnel_delivered_leasesets_are_rejected() {
    let mut net = spawn_netdb(1).await;
    let dest = PrivateIdentity::generate();
    let ls = LeaseSet::build(*dest.identity(), vec![]);

    net.handle.post_message(Message {
        msg_type: I2NP_DATABASE_STORE,
        payload: i2np::encode_database_store_leaseset(&dest.hash(), ls.buffer()),
        from_tunnel: Some(77),
    });

    // Barrier: a lookup queued behind the store gets answered only after
    // the store was processed.
    let asker = IdentHash([0x0C; 32]);
    let probe = IdentHash([0x57; 32]);
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&probe, &asker, None, &[]),
    ));
    next_direct(&mut net.transport_rx, I2NP_DATABASE_SEARCH_REPLY, &probe).await;

    assert!(
        net.store.find_leaseset(&dest.hash()).is_none(),
        "tunneled lease set must be dropped"
    );

    // The same bytes arriving directly are accepted.
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_STORE,
        i2np::encode_database_store_leaseset(&dest.hash(), ls.buffer()),
    ));
    net.handle.post_message(Message::direct(
        I2NP_DATABASE_LOOKUP,
        i2np::encode_database_lookup(&probe, &asker, None, &[]),
    ));
    next_direct(&mut net.transport_rx, I2NP_DATABASE_SEARCH_REPLY, &probe).await;
    assert!(net.store.find_leaseset(&dest.hash()).is_some());
}
