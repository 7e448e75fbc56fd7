//! Engine behaviour against an in-process transport.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use satchel_core::constants::Network;
use satchel_network::{NetworkMessage, PeerTransport, SyncPhase};
use satchel_node_lib::{EngineError, SendError, WalletEvent};

use common::*;

fn funded_chain(len: u64, value: u64) -> Vec<satchel_core::types::Block> {
    let a0 = receive_address(0);
    build_chain(len, HashMap::from([(2, vec![payment(&a0, value, 1)])]))
}

#[tokio::test]
async fn catch_up_applies_blocks_in_order_and_completes_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let chain = funded_chain(5, COIN);
    let peer = transport.add_peer(chain.clone());
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(peer);
    let events = collect_until_synced(&mut sub).await;

    assert_eq!(events[0], WalletEvent::PeerConnected { peer, peers: 1 });
    let heights: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            WalletEvent::BlockReceived { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(heights, vec![0, 1, 2, 3, 4]);
    assert!(events.contains(&WalletEvent::BlockReceived {
        hash: chain[4].hash(),
        height: 4,
        blocks_remaining: 0
    }));
    let txid = chain[2].transactions[1].txid();
    assert!(events.contains(&WalletEvent::CoinsReceived { txid, amount: COIN, balance: COIN }));
    assert_eq!(events.last(), Some(&WalletEvent::SyncComplete { height: Some(4) }));

    let balance = engine.balance();
    assert_eq!(balance.confirmed, COIN);
    assert_eq!(balance.unconfirmed, 0);
    assert_eq!(engine.history().len(), 1);
    assert_eq!(engine.history()[0].height, Some(2));

    let progress = engine.sync_progress();
    assert_eq!(progress.phase, SyncPhase::Synced);
    assert_eq!(progress.blocks_remaining, 0);
    assert_eq!(progress.applied_height, Some(4));
    assert_eq!(engine.peer_count(), 1);

    // Nothing more arrives until something new happens.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(sub.try_recv().is_none());

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn tampered_block_is_rejected_and_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let chain = funded_chain(5, COIN);
    let peer = transport.add_peer(chain.clone());
    transport.tamper_once(peer, 2);
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(peer);
    collect_until_synced(&mut sub).await;

    assert_eq!(transport.block_requests(&chain[2].hash()), 2);
    assert_eq!(transport.block_requests(&chain[3].hash()), 1);
    assert_eq!(engine.balance().confirmed, COIN);
    assert_eq!(engine.history().len(), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn mismatched_block_is_rejected_and_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let chain = funded_chain(6, COIN);
    let peer = transport.add_peer(chain.clone());
    // Asked for height 1, answers with height 2 once.
    transport.swap_once(peer, 1);
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(peer);
    let events = collect_until_synced(&mut sub).await;

    assert_eq!(transport.block_requests(&chain[1].hash()), 2);
    let heights: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            WalletEvent::BlockReceived { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    assert_eq!(heights, (0..6).collect::<Vec<_>>());
    assert_eq!(engine.balance().confirmed, COIN);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn overlapping_peers_apply_each_block_once() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let chain = funded_chain(8, 3 * COIN);
    let a = transport.add_peer(chain.clone());
    let b = transport.add_peer(chain.clone());
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(a);
    transport.connect(b);
    let events = collect_until_synced(&mut sub).await;
    let mut heights: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            WalletEvent::BlockReceived { height, .. } => Some(*height),
            _ => None,
        })
        .collect();
    // A peer may finish its handshake after the first completion.
    while engine.peer_count() < 2 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    heights.sort_unstable();
    assert_eq!(heights, (0..8).collect::<Vec<_>>());

    // The same announcement from both peers is applied once.
    let tip = next_block(&chain, vec![payment(&receive_address(1), COIN, 9)]);
    transport.mine(a, tip.clone());
    transport.mine(b, tip.clone());
    let event = wait_for(&mut sub, |e| matches!(e, WalletEvent::BlockReceived { .. })).await;
    assert_eq!(event, WalletEvent::BlockReceived { hash: tip.hash(), height: 8, blocks_remaining: 0 });

    tokio::time::sleep(Duration::from_millis(600)).await;
    while let Some(event) = sub.try_recv() {
        assert!(!matches!(event, WalletEvent::BlockReceived { .. }), "reapplied: {event:?}");
    }
    assert_eq!(engine.balance().confirmed, 4 * COIN);
    assert_eq!(engine.history().len(), 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn incompatible_peer_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(3, COIN));
    transport.set_network(peer, Network::Mainnet);
    let engine = start_engine(config(dir.path()), transport.clone()).await;

    transport.connect(peer);
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(engine.peer_count(), 0);
    assert_eq!(transport.peer_count(), 0);
    assert_eq!(engine.sync_progress().phase, SyncPhase::WaitingForPeers);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn peer_claiming_top_height_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let liar = transport.add_peer(funded_chain(3, COIN));
    transport.announce_height(liar, u64::MAX);
    let honest = transport.add_peer(funded_chain(3, COIN));
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(liar);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.peer_count(), 0);
    let progress = engine.sync_progress();
    assert_eq!(progress.phase, SyncPhase::WaitingForPeers);
    assert_eq!(progress.best_height, None);
    assert_eq!(progress.blocks_remaining, 0);

    // The engine keeps working for peers that tell the truth.
    transport.connect(honest);
    collect_until_synced(&mut sub).await;
    assert_eq!(engine.peer_count(), 1);
    assert_eq!(engine.sync_progress().applied_height, Some(2));
    assert_eq!(engine.balance().confirmed, COIN);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn outputs_overflowing_balance_are_not_applied() {
    let dir = tempfile::tempdir().unwrap();
    let half = u64::MAX / 2 + 1;
    let (a0, a1) = (receive_address(0), receive_address(1));
    let overflow = payment(&a1, half, 2);
    let chain = build_chain(
        4,
        HashMap::from([(2, vec![payment(&a0, half, 1)]), (3, vec![overflow.clone()])]),
    );
    let transport = MockTransport::new();
    let peer = transport.add_peer(chain.clone());
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    transport.connect(peer);
    wait_for(&mut sub, |e| matches!(e, WalletEvent::BlockReceived { height: 2, .. })).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The block is asked for again but never applied.
    assert!(transport.block_requests(&chain[3].hash()) >= 1);
    assert_eq!(engine.sync_progress().applied_height, Some(2));
    assert_eq!(engine.balance().confirmed, half);
    assert_eq!(engine.history().len(), 1);

    transport.gossip(peer, NetworkMessage::NewTransaction(overflow));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.balance().unconfirmed, 0);
    assert_eq!(engine.balance().total(), half);
    assert_eq!(engine.history().len(), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn manual_peer_is_dialed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(4, COIN));
    transport.set_dial_target(peer);
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();

    let event = wait_for(&mut sub, |e| matches!(e, WalletEvent::SyncComplete { .. })).await;
    assert_eq!(event, WalletEvent::SyncComplete { height: Some(3) });
    assert_eq!(engine.balance().confirmed, COIN);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_manual_peer_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let mut config = config(dir.path());
    config.p2p.max_retries = Some(2);
    let engine = start_engine(config, transport.clone()).await;
    let mut sub = engine.subscribe();

    let event = wait_for(&mut sub, |e| matches!(e, WalletEvent::PeersExhausted)).await;
    assert_eq!(event, WalletEvent::PeersExhausted);
    assert_eq!(engine.peer_count(), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn send_reserves_input_and_pays_change_to_fresh_address() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let chain = funded_chain(4, COIN);
    let peer = transport.add_peer(chain.clone());
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;
    assert_eq!(engine.balance().total(), COIN);

    let dest = foreign_address();
    let sent = engine.send(&dest.encode(), "0.5").await.unwrap();
    assert_eq!(sent.amount.to_sat(), COIN / 2);
    assert_eq!(sent.peer, peer);

    // Pending-spent before any confirmation.
    let balance = engine.balance();
    assert_eq!(balance.pending_spent, COIN);
    assert_eq!(balance.confirmed, COIN);

    let submitted = transport.submitted();
    assert_eq!(submitted.len(), 1);
    let tx = &submitted[0].1;
    assert_eq!(tx.txid(), sent.txid);
    assert_eq!(tx.inputs.len(), 1);
    assert_eq!(tx.inputs[0].previous_output.txid, chain[2].transactions[1].txid());

    let fee = engine.config().fee;
    let change_address = mirror_keychain().fresh_change_address().unwrap().0;
    assert_ne!(change_address, receive_address(0));
    let payment_out = tx.outputs.iter().find(|o| o.script_pubkey == dest.script_pubkey()).unwrap();
    assert_eq!(payment_out.value, COIN / 2);
    let change_out = tx
        .outputs
        .iter()
        .find(|o| o.script_pubkey == change_address.script_pubkey())
        .unwrap();
    assert_eq!(change_out.value, COIN / 2 - fee);
    assert!(
        transport.broadcasts().contains(&NetworkMessage::NewTransaction(tx.clone())),
        "accepted transaction is relayed"
    );

    // The only coin is reserved, so nothing is left to spend.
    let err = engine.send(&dest.encode(), "0.1").await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert_eq!(engine.balance(), balance);

    // Confirmation spends the input and credits the change.
    transport.mine(peer, next_block(&chain, vec![tx.clone()]));
    let event = wait_for(&mut sub, |e| matches!(e, WalletEvent::CoinsSent { .. })).await;
    assert_eq!(
        event,
        WalletEvent::CoinsSent { txid: sent.txid, amount: COIN / 2 + fee, balance: COIN / 2 - fee }
    );
    let balance = engine.balance();
    assert_eq!(balance.confirmed, COIN / 2 - fee);
    assert_eq!(balance.pending_spent, 0);
    assert_eq!(engine.history().len(), 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_sends_of_single_utxo() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(3, COIN));
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;

    let dest = foreign_address().encode();
    let (first, second) = tokio::join!(engine.send(&dest, "0.3"), engine.send(&dest, "0.3"));
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert_eq!(transport.submitted().len(), 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn send_validation_never_touches_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(3, COIN));
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;
    let before = engine.balance();

    let err = engine.send("not-an-address", "0.1").await.unwrap_err();
    assert_eq!(err.code(), "ADDRESS_INVALID");
    let err = engine.send(&foreign_address().encode(), "-1").await.unwrap_err();
    assert_eq!(err.code(), "AMOUNT_INVALID");
    let err = engine.send(&foreign_address().encode(), "2").await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");

    assert!(transport.submitted().is_empty());
    assert_eq!(engine.balance(), before);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn send_timeout_keeps_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(3, COIN));
    transport.set_submit(peer, SubmitBehaviour::Hang);
    let mut config = config(dir.path());
    config.send_timeout = Duration::from_millis(300);
    let engine = start_engine(config, transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;

    let err = engine.send(&foreign_address().encode(), "0.5").await.unwrap_err();
    assert!(matches!(err, SendError::Timeout(d) if d == Duration::from_millis(300)));
    assert_eq!(err.code(), "TIMEOUT");
    // The transaction may still propagate, so its input stays locked.
    assert_eq!(engine.balance().pending_spent, COIN);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn timed_out_send_is_relayed_then_released() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let mut chain = funded_chain(3, COIN);
    let peer = transport.add_peer(chain.clone());
    transport.set_submit(peer, SubmitBehaviour::Hang);
    let mut config = config(dir.path());
    config.send_timeout = Duration::from_millis(300);
    config.reservation_expiry_blocks = 2;
    let engine = start_engine(config, transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;

    let err = engine.send(&foreign_address().encode(), "0.5").await.unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert_eq!(engine.balance().pending_spent, COIN);
    let (_, tx) = transport.submitted().pop().unwrap();

    // One block later the send is still reserved and goes out over gossip again.
    let block = next_block(&chain, vec![]);
    chain.push(block.clone());
    transport.mine(peer, block);
    wait_for(&mut sub, |e| matches!(e, WalletEvent::BlockReceived { height: 3, .. })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.balance().pending_spent, COIN);
    assert!(transport.broadcasts().contains(&NetworkMessage::NewTransaction(tx)));

    // A second block without a sighting gives the input back.
    let block = next_block(&chain, vec![]);
    chain.push(block.clone());
    transport.mine(peer, block);
    wait_for(&mut sub, |e| matches!(e, WalletEvent::BlockReceived { height: 4, .. })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.balance().pending_spent, 0);
    assert_eq!(engine.balance().confirmed, COIN);

    transport.set_submit(peer, SubmitBehaviour::Accept);
    engine.send(&foreign_address().encode(), "0.5").await.unwrap();
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_submission_releases_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(3, COIN));
    transport.set_submit(peer, SubmitBehaviour::Reject("conflicting spend".into()));
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;

    let err = engine.send(&foreign_address().encode(), "0.5").await.unwrap_err();
    assert_eq!(err.code(), "INTERNAL_ERROR");
    assert_eq!(engine.balance().pending_spent, 0);

    transport.set_submit(peer, SubmitBehaviour::Reject("insufficient funds".into()));
    let err = engine.send(&foreign_address().encode(), "0.5").await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
    assert_eq!(engine.balance().pending_spent, 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_within_grace_persists_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let chain = funded_chain(5, 2 * COIN);

    let transport = MockTransport::new();
    let peer = transport.add_peer(chain.clone());
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    collect_until_synced(&mut sub).await;
    let balance = engine.balance();
    let history = engine.history();

    engine.stop().await.unwrap();
    assert!(transport.is_shut_down());
    assert!(matches!(engine.stop().await, Err(EngineError::Stopped)));
    let err = engine.send(&foreign_address().encode(), "0.1").await.unwrap_err();
    assert_eq!(err.code(), "INTERNAL_ERROR");
    drop(engine);
    // Let the coordinator release the database.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let transport = MockTransport::new();
    let peer = transport.add_peer(chain);
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    assert_eq!(engine.balance(), balance);
    assert_eq!(engine.history(), history);
    assert_eq!(engine.sync_progress().applied_height, Some(4));

    let mut sub = engine.subscribe();
    transport.connect(peer);
    let events = collect_until_synced(&mut sub).await;
    assert!(!events.iter().any(|e| matches!(e, WalletEvent::BlockReceived { .. })));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn stop_reports_timeout_when_work_does_not_settle() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let peer = transport.add_peer(funded_chain(5, COIN));
    transport.hang_block_requests(peer);
    let engine = start_engine(config(dir.path()), transport.clone()).await;
    let mut sub = engine.subscribe();
    transport.connect(peer);
    wait_for(&mut sub, |e| matches!(e, WalletEvent::PeerConnected { .. })).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let grace = Duration::from_millis(200);
    let started = tokio::time::Instant::now();
    let result = engine.stop_within(grace).await;
    assert_eq!(result, Err(EngineError::ShutdownTimeout(grace)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(transport.is_shut_down());
}

#[tokio::test]
async fn new_receive_address_advances() {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let engine = start_engine(config(dir.path()), transport.clone()).await;

    let first = engine.new_receive_address().unwrap();
    let second = engine.new_receive_address().unwrap();
    assert_eq!(first, receive_address(0));
    assert_eq!(second, receive_address(1));
    engine.stop().await.unwrap();
}
