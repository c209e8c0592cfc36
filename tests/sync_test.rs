mod common;

use common::{Cluster, engine_with_blocks, init_logger, keys, validator_set};
use tessera::consensus::{ConsensusAction, ConsensusConfig};
use tessera::crypto::Address;
use tessera::storage::Persistence;
use tessera::types::{Block, BlockReply, ConsensusMessage, Phase, StateSyncMessage};

/// A committed chain of `tip` blocks produced by a real four-validator run.
fn committed_chain(tip: u64) -> Vec<Block> {
    let mut cluster = Cluster::new(4, ConsensusConfig::default());
    cluster.start();
    assert!(cluster.run_until(20_000, |c| c.min_height() > tip));
    let mut chain = cluster.committed(0);
    chain.truncate(tip as usize);
    chain
}

fn seed_where(pred: impl Fn(Address) -> bool) -> u64 {
    (0..4u64)
        .find(|s| pred(keys(4)[*s as usize].0.address()))
        .unwrap()
}

fn state_sync_replies(actions: Vec<ConsensusAction>) -> Vec<(Address, StateSyncMessage)> {
    actions
        .into_iter()
        .filter_map(|a| match a {
            ConsensusAction::SendStateSync(to, msg) => Some((to, msg)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_metadata_reports_served_range() {
    init_logger();
    let chain = committed_chain(4);
    let (mut responder, _) = engine_with_blocks(0, 4, &chain, ConsensusConfig::default());
    assert_eq!(responder.height(), 5);

    let requester = keys(4)[1].0.address();
    let actions = responder
        .handle_state_sync_message(StateSyncMessage::MetadataRequest {
            peer_address: requester,
        })
        .unwrap();
    let replies = state_sync_replies(actions);
    assert_eq!(replies.len(), 1);
    let (to, reply) = &replies[0];
    assert_eq!(*to, requester);
    match reply {
        StateSyncMessage::MetadataResponse(meta) => {
            assert_eq!(meta.peer_address, responder.address());
            assert_eq!(meta.min_height, 1);
            assert_eq!(meta.max_height, 4);
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_block_requests_found_and_not_found() {
    init_logger();
    let chain = committed_chain(5);
    let (mut responder, _) = engine_with_blocks(0, 4, &chain, ConsensusConfig::default());
    let requester = keys(4)[1].0.address();

    let actions = responder
        .handle_state_sync_message(StateSyncMessage::GetBlockRequest {
            peer_address: requester,
            height: 1,
        })
        .unwrap();
    match &state_sync_replies(actions)[0].1 {
        StateSyncMessage::GetBlockResponse { height, block, .. } => {
            assert_eq!(*height, 1);
            match block {
                BlockReply::Found(block) => {
                    assert_eq!(block.height(), 1);
                    assert_eq!(block.hash(), chain[0].hash());
                }
                BlockReply::NotFound => panic!("block 1 should be served"),
            }
        }
        other => panic!("unexpected reply {:?}", other),
    }

    let actions = responder
        .handle_state_sync_message(StateSyncMessage::GetBlockRequest {
            peer_address: requester,
            height: 6,
        })
        .unwrap();
    match &state_sync_replies(actions)[0].1 {
        StateSyncMessage::GetBlockResponse { height, block, .. } => {
            assert_eq!(*height, 6);
            assert_eq!(*block, BlockReply::NotFound);
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_lagging_replica_catches_up_and_votes() {
    init_logger();
    let chain = committed_chain(2);
    let validators = validator_set(4);
    let leader_h2 = validators.leader_for(2, 0).address;
    let leader_h3 = validators.leader_for(3, 0).address;

    let lagging_seed = seed_where(|a| a != leader_h2 && a != leader_h3);
    let peer_seed = seed_where(|a| a != keys(4)[lagging_seed as usize].0.address());
    let leader_seed = seed_where(|a| a == leader_h3);

    let (mut lagging, lagging_store) =
        engine_with_blocks(lagging_seed, 4, &chain[..1], ConsensusConfig::default());
    let (mut peer, _) = engine_with_blocks(peer_seed, 4, &chain, ConsensusConfig::default());
    let (mut leader, _) = engine_with_blocks(leader_seed, 4, &chain, ConsensusConfig::default());
    lagging.start().unwrap();
    assert_eq!(lagging.height(), 2);

    // Aggregated metadata says the network has committed height 2.
    let actions = lagging
        .set_aggregated_state_sync_metadata(1, 2, peer.address())
        .unwrap();
    assert!(lagging.is_syncing());
    assert_eq!(lagging.node_state().leader_id, None);
    let requests = state_sync_replies(actions);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, peer.address());

    let served = peer
        .handle_state_sync_message(requests[0].1.clone())
        .unwrap();
    let (to, response) = state_sync_replies(served).remove(0);
    assert_eq!(to, lagging.address());

    // Duplicate deliveries of the same block apply once.
    lagging.handle_state_sync_message(response.clone()).unwrap();
    lagging.handle_state_sync_message(response).unwrap();
    assert_eq!(lagging.height(), 3);
    assert!(!lagging.is_syncing());
    assert_eq!(lagging_store.read(2).unwrap().unwrap().hash(), chain[1].hash());

    let state = lagging.node_state();
    assert_eq!(state.height, 3);
    assert_eq!(state.round, 0);
    assert!(!state.is_leader);

    // The leader of height 3 proposes; the caught-up replica votes for it.
    let proposal = leader
        .start()
        .unwrap()
        .into_iter()
        .find_map(|a| match a {
            ConsensusAction::BroadcastProposal(p) => Some(p),
            _ => None,
        })
        .unwrap();
    assert_eq!(proposal.height, 3);
    let actions = lagging
        .handle_consensus_message(ConsensusMessage::Proposal(proposal))
        .unwrap();
    let vote = actions
        .into_iter()
        .find_map(|a| match a {
            ConsensusAction::SendVote(to, vote) => Some((to, vote)),
            _ => None,
        })
        .unwrap();
    assert_eq!(vote.0, leader.address());
    assert_eq!(vote.1.height, 3);
    assert_eq!(vote.1.phase, Phase::Prepare);
}

#[test]
fn test_isolated_replica_rejoins_through_state_sync() {
    init_logger();
    let mut cluster = Cluster::new(4, ConsensusConfig::default());
    let lagging = 3;
    cluster.isolate(lagging);
    cluster.start();

    let live = [0usize, 1, 2];
    assert!(cluster.run_until(50_000, |c| {
        live.iter().all(|i| c.replicas[*i].engine.height() >= 4)
    }));
    assert_eq!(cluster.replicas[lagging].engine.height(), 1);

    cluster.heal(lagging);
    assert!(cluster.run_until(50_000, |c| c.replicas[lagging].engine.height() >= 4));

    let reference = cluster.committed(0);
    let caught_up = cluster.committed(lagging);
    for (a, b) in reference.iter().zip(caught_up.iter()) {
        assert_eq!(a.hash(), b.hash());
    }
}

#[test]
fn test_silent_peer_does_not_keep_replica_syncing() {
    init_logger();
    let (mut engine, _) = engine_with_blocks(0, 4, &[], ConsensusConfig::default());
    engine.start().unwrap();
    let peer = keys(4)[1].0.address();

    let actions = engine.set_aggregated_state_sync_metadata(1, 5, peer).unwrap();
    assert!(engine.is_syncing());
    assert_eq!(engine.node_state().leader_id, None);
    assert!(!state_sync_replies(actions).is_empty());

    // The peer never answers; its fetches expire and its advertisement goes with them.
    for _ in 0..10 {
        engine.on_sync_tick().unwrap();
    }
    assert!(!engine.is_syncing());
    assert_eq!(engine.height(), 1);
    assert!(engine.node_state().leader_id.is_some());
}

#[test]
fn test_unreachable_advertised_range_is_ignored() {
    init_logger();
    let (mut engine, _) = engine_with_blocks(0, 4, &[], ConsensusConfig::default());
    engine.start().unwrap();
    let peer = keys(4)[1].0.address();

    let actions = engine
        .set_aggregated_state_sync_metadata(1 << 40, 1 << 40, peer)
        .unwrap();
    assert!(state_sync_replies(actions).is_empty());
    assert!(!engine.is_syncing());
    assert!(engine.node_state().leader_id.is_some());
}
