mod common;

use common::{Cluster, engine_with_blocks, init_logger, keys, validator_set};
use tessera::consensus::{ConsensusAction, ConsensusConfig};
use tessera::crypto::Hash;
use tessera::types::{Block, ConsensusMessage, Phase, Proposal, ViewStamp};
use tessera::utility::ledger_state_hash;

fn leader_proposal(seed: u64, height: u64, round: u64, txs: Vec<Vec<u8>>) -> Proposal {
    let keys = keys(4);
    let (pk, sk) = &keys[seed as usize];
    let state_hash = ledger_state_hash(height, &Hash::default(), &txs);
    let block = Block::new(height, round, state_hash, Hash::default(), pk.address(), txs);
    Proposal::new(
        sk,
        pk.address(),
        ViewStamp::new(height, round, Phase::Propose),
        Some(block),
        None,
    )
}

fn seed_of(address: &tessera::crypto::Address) -> u64 {
    keys(4)
        .iter()
        .position(|(pk, _)| pk.address() == *address)
        .unwrap() as u64
}

#[test]
fn test_cluster_commits_several_heights() {
    init_logger();
    let mut cluster = Cluster::new(4, ConsensusConfig::default());
    cluster.replicas[0]
        .pool
        .add_transaction(b"transfer:alice:bob:5".to_vec())
        .unwrap();
    cluster.start();

    assert!(cluster.run_until(20_000, |c| c.min_height() >= 5));

    let reference = cluster.committed(0);
    assert!(reference.len() >= 4);
    for i in 1..4 {
        let chain = cluster.committed(i);
        for (a, b) in reference.iter().zip(chain.iter()) {
            assert_eq!(a.hash(), b.hash());
        }
    }

    // Every committed block embeds a valid commit certificate for itself.
    let validators = validator_set(4);
    for block in &reference {
        let qc = block.header.quorum_certificate.as_ref().unwrap();
        assert_eq!(qc.phase, Phase::Commit);
        assert_eq!(qc.block_hash, block.hash());
        qc.verify(&validators).unwrap();
        let builder = validators.leader_for(block.height(), block.header.round);
        assert_eq!(block.header.proposer_address, builder.address);
    }

    // Chain links through state hashes.
    for pair in reference.windows(2) {
        assert_eq!(pair[1].header.prev_state_hash, pair[0].header.state_hash);
    }

    // Only replica 0 pooled the transaction, and only while it led a height.
    let carried = reference
        .iter()
        .any(|b| b.transactions.contains(&b"transfer:alice:bob:5".to_vec()));
    let proposer_0 = cluster.address(0);
    assert_eq!(
        carried,
        reference.iter().any(|b| b.header.proposer_address == proposer_0)
    );
}

#[test]
fn test_leader_agrees_across_replicas() {
    let cluster = Cluster::new(4, ConsensusConfig::default());
    let expected = cluster.replicas[0]
        .engine
        .get_leader_for_view(4, 1, Phase::Propose);
    for replica in &cluster.replicas {
        assert_eq!(replica.engine.get_leader_for_view(4, 1, Phase::Propose), expected);
        assert_eq!(replica.engine.get_leader_for_view(4, 1, Phase::Commit), expected);
    }
    assert!((1..=4).contains(&expected));
}

#[test]
fn test_replica_votes_for_valid_proposal() {
    init_logger();
    let validators = validator_set(4);
    let leader = validators.leader_for(1, 0).address;
    let follower_seed = (0..4u64)
        .find(|s| keys(4)[*s as usize].0.address() != leader)
        .unwrap();
    let (mut engine, _) = engine_with_blocks(follower_seed, 4, &[], ConsensusConfig::default());

    let proposal = leader_proposal(seed_of(&leader), 1, 0, vec![b"tx".to_vec()]);
    let block_hash = proposal.block.as_ref().unwrap().hash();
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(proposal))
        .unwrap();

    let vote = actions
        .iter()
        .find_map(|a| match a {
            ConsensusAction::SendVote(to, vote) => Some((*to, vote.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(vote.0, leader);
    assert_eq!(vote.1.phase, Phase::Prepare);
    assert_eq!(vote.1.block_hash, block_hash);
    assert_eq!(engine.phase(), Phase::Prepare);
}

#[test]
fn test_invalid_proposals_are_dropped() {
    init_logger();
    let validators = validator_set(4);
    let leader = validators.leader_for(1, 0).address;
    let others: Vec<u64> = (0..4u64)
        .filter(|s| keys(4)[*s as usize].0.address() != leader)
        .collect();
    let (mut engine, _) = engine_with_blocks(others[0], 4, &[], ConsensusConfig::default());

    // Signed by a validator that does not lead (1, 0).
    let impostor = leader_proposal(others[1], 1, 0, vec![]);
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(impostor))
        .unwrap();
    assert!(actions.is_empty());
    assert_eq!(engine.phase(), Phase::NewRound);

    // Right leader, but the signature does not cover the carried block.
    let mut tampered = leader_proposal(seed_of(&leader), 1, 0, vec![]);
    let other = leader_proposal(seed_of(&leader), 1, 0, vec![b"x".to_vec()]);
    tampered.block = other.block;
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(tampered))
        .unwrap();
    assert!(actions.is_empty());

    // Proposals for a later height are never voted on.
    let future_leader = validators.leader_for(3, 0).address;
    let future = leader_proposal(seed_of(&future_leader), 3, 0, vec![]);
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(future))
        .unwrap();
    assert!(
        actions
            .iter()
            .all(|a| !matches!(a, ConsensusAction::SendVote(..)))
    );
    assert_eq!(engine.height(), 1);
    assert_eq!(engine.phase(), Phase::NewRound);
}

#[test]
fn test_leader_reproposes_locked_block() {
    init_logger();
    let mut cluster = Cluster::new(4, ConsensusConfig::default());
    cluster.start();

    // Let the height reach Commit everywhere, then lose the decide.
    let locked = cluster.run_until(1_000, |c| {
        c.replicas.iter().all(|r| r.engine.locked_block().is_some())
    });
    assert!(locked);
    let locked_hash = cluster.replicas[0].engine.locked_block().unwrap().hash();
    for r in &cluster.replicas {
        assert_eq!(r.engine.height(), 1);
        assert_eq!(r.engine.locked_block().unwrap().hash(), locked_hash);
    }

    // Whatever happens next, height 1 can only commit the locked block.
    for i in 0..4 {
        cluster.replicas[i].pool.add_transaction(vec![i as u8]).unwrap();
    }
    for i in 0..4 {
        let actions = cluster.replicas[i].engine.advance_view().unwrap();
        cluster.route(i, actions);
    }
    assert!(cluster.run_until(20_000, |c| c.min_height() >= 2));
    for i in 0..4 {
        assert_eq!(cluster.committed(i)[0].hash(), locked_hash);
    }
}

#[test]
fn test_invalid_higher_round_proposal_leaves_view_untouched() {
    init_logger();
    let validators = validator_set(4);
    let far_leader = validators.leader_for(1, 1000).address;
    let victim = (0..4u64)
        .find(|s| {
            let address = keys(4)[*s as usize].0.address();
            address != far_leader && address != validators.leader_for(1, 0).address
        })
        .unwrap();
    let (mut engine, _) = engine_with_blocks(victim, 4, &[], ConsensusConfig::default());
    let armed = engine
        .start()
        .unwrap()
        .into_iter()
        .find_map(|a| match a {
            ConsensusAction::ArmTimer(stamp, _) => Some(stamp),
            _ => None,
        })
        .unwrap();
    assert_eq!(armed, ViewStamp::new(1, 0, Phase::NewRound));

    // Correctly signed by the leader of round 1000, but the state hash is made up.
    let keys = keys(4);
    let (pk, sk) = &keys[seed_of(&far_leader) as usize];
    let block = Block::new(1, 1000, Hash([7u8; 32]), Hash::default(), pk.address(), vec![]);
    let bogus = Proposal::new(
        sk,
        pk.address(),
        ViewStamp::new(1, 1000, Phase::Propose),
        Some(block),
        None,
    );
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(bogus))
        .unwrap();
    assert!(actions.is_empty());
    assert_eq!(engine.round(), 0);
    assert_eq!(engine.phase(), Phase::NewRound);

    // The original timer is still the live one and rotates the round.
    engine.on_timeout(armed).unwrap();
    assert_eq!(engine.round(), 1);
}

#[test]
fn test_valid_higher_round_proposal_moves_and_rearms() {
    init_logger();
    let validators = validator_set(4);
    let leader = validators.leader_for(1, 5).address;
    let follower = (0..4u64)
        .find(|s| keys(4)[*s as usize].0.address() != leader)
        .unwrap();
    let (mut engine, _) = engine_with_blocks(follower, 4, &[], ConsensusConfig::default());

    let proposal = leader_proposal(seed_of(&leader), 1, 5, vec![]);
    let actions = engine
        .handle_consensus_message(ConsensusMessage::Proposal(proposal))
        .unwrap();
    assert_eq!(engine.round(), 5);
    assert_eq!(engine.phase(), Phase::Prepare);
    assert!(actions.iter().any(|a| matches!(a, ConsensusAction::SendVote(to, _) if *to == leader)));
    assert!(actions.iter().any(|a| matches!(
        a,
        ConsensusAction::ArmTimer(stamp, _) if *stamp == ViewStamp::new(1, 5, Phase::Prepare)
    )));
}
