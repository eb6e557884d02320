mod common;

use common::{misbehaves, register_all, synced_context, MnFixture, MockChain, MockUtxo};

use ferrite_masternode::active::ActiveMasternode;
use ferrite_masternode::chain::{GovernanceView, NoGovernance};
use ferrite_masternode::constants::{SIGNATURES_REQUIRED, SIGNATURES_TOTAL};
use ferrite_masternode::context::MasternodeContext;
use ferrite_masternode::MasternodeError;
use ferrite_crypto::FerriteKeyPair;
use ferrite_shared_types::masternode::{MasternodeParams, MasternodeState};
use ferrite_shared_types::p2p::{Inv, InvKind, MasternodeMessage, NetEvent};
use ferrite_shared_types::{OutPoint, Script, TxOutput};
use std::net::SocketAddr;

const T0: i64 = 1_700_000_000;

fn election_setup(tip: u64) -> (MasternodeContext, MockChain, MockUtxo, Vec<MnFixture>) {
    let params = MasternodeParams::default();
    let chain = MockChain::new(tip, T0);
    let mut utxo = MockUtxo::default();
    let ctx = synced_context(params);

    let fixtures: Vec<MnFixture> = (1..=12).map(MnFixture::new).collect();
    register_all(&ctx, &fixtures, &mut utxo, T0 - 7_200, 10);
    ctx.registry.updated_block_tip(tip);
    ctx.election.set_cached_height(tip);
    (ctx, chain, utxo, fixtures)
}

fn fixture_for<'a>(fixtures: &'a [MnFixture], outpoint: &OutPoint) -> &'a MnFixture {
    fixtures.iter().find(|f| &f.outpoint == outpoint).unwrap()
}

/// Voters ranked in the top of the list at the vote's anchoring height.
fn top_voters<'a>(
    ctx: &MasternodeContext,
    chain: &MockChain,
    fixtures: &'a [MnFixture],
    vote_height: u64,
    count: usize,
) -> Vec<&'a MnFixture> {
    let anchor = vote_height - 101;
    let ranked = ctx
        .registry
        .ranks(anchor, ctx.params.min_protocol_version, chain, &ctx.sync)
        .unwrap();
    ranked
        .iter()
        .take(count)
        .map(|(_, mn)| fixture_for(fixtures, &mn.outpoint))
        .collect()
}

#[test]
fn happy_path_election() {
    let (ctx, chain, utxo, fixtures) = election_setup(100);
    let height = 110;

    let (winner, _, eligible) = ctx
        .election
        .choose_next_payee(height, true, &ctx.registry, &chain, &utxo, &ctx.sync)
        .unwrap();
    assert_eq!(eligible, 12);
    let payee = winner.payee_script();

    // Deterministic: the same registry and chain state yield the same winner.
    let (winner_again, _, _) = ctx
        .election
        .choose_next_payee(height, true, &ctx.registry, &chain, &utxo, &ctx.sync)
        .unwrap();
    assert_eq!(winner.outpoint, winner_again.outpoint);

    // Six top-ranked masternodes agree.
    let peer = "8.8.8.8:9999".parse().unwrap();
    for voter in top_voters(&ctx, &chain, &fixtures, height, SIGNATURES_REQUIRED) {
        let vote = voter.vote(height, payee.clone(), &chain, &ctx.params);
        let accepted = ctx
            .election
            .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
            .unwrap();
        assert!(accepted);
    }

    let (best, activation) = ctx
        .election
        .get_best_payee(height, &ctx.registry, &utxo)
        .unwrap();
    assert_eq!(best, payee);
    assert_eq!(activation, 10);

    // A coinbase paying the winner within bounds validates.
    let good = vec![TxOutput {
        value: ctx.params.primary_payment_max(),
        script_pubkey: payee.clone(),
    }];
    assert!(ctx.election.is_transaction_valid(&good, height));

    // Paying someone else, or paying too much, does not.
    let wrong_payee = vec![TxOutput {
        value: ctx.params.primary_payment_max(),
        script_pubkey: vec![0xde, 0xad],
    }];
    assert!(!ctx.election.is_transaction_valid(&wrong_payee, height));
    let too_much = vec![TxOutput {
        value: ctx.params.primary_payment_max() + 1,
        script_pubkey: payee,
    }];
    assert!(!ctx.election.is_transaction_valid(&too_much, height));
}

#[test]
fn produce_vote_when_top_ranked() {
    let (ctx, chain, utxo, fixtures) = election_setup(100);
    let height = 110;

    let voter = top_voters(&ctx, &chain, &fixtures, height, 1)[0];
    let seed = voter.outpoint.txid[0];
    let active = ActiveMasternode::new(
        voter.outpoint.clone(),
        voter.addr,
        FerriteKeyPair::from_seed(&[seed.wrapping_add(64); 32]).unwrap(),
    );

    let produced = ctx
        .election
        .produce_vote(height, Some(&active), &ctx.registry, &chain, &utxo, &ctx.sync)
        .unwrap();
    assert!(produced);
    assert!(ctx.election.has_block(height));
    let relayed = ctx
        .drain_net_events()
        .iter()
        .any(|e| matches!(e, NetEvent::Relay(MasternodeMessage::PaymentVotePrimary(_))));
    assert!(relayed);
}

#[test]
fn vote_acceptance_window_boundaries() {
    let (ctx, chain, _utxo, fixtures) = election_setup(6_000);
    let limit = 5_000u64; // min_blocks_to_store dominates at this size
    let peer = "8.8.8.8:9999".parse().unwrap();
    let payee: Script = vec![0x00, 0x14, 7];

    // Exactly at the storage horizon: accepted.
    let vote = fixtures[0].vote(6_000 - limit, payee.clone(), &chain, &ctx.params);
    assert!(ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap());

    // One block older: out of range.
    let vote = fixtures[1].vote(6_000 - limit - 1, payee.clone(), &chain, &ctx.params);
    let err = ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap_err();
    assert!(matches!(err, MasternodeError::OutOfRange(_)));

    // Twenty blocks ahead: accepted, if the voter ranks high enough.
    let future = 6_020;
    let voter = top_voters(&ctx, &chain, &fixtures, future, 1)[0];
    let vote = voter.vote(future, payee.clone(), &chain, &ctx.params);
    assert!(ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap());

    // Twenty-one: rejected.
    let vote = fixtures[2].vote(6_021, payee, &chain, &ctx.params);
    let err = ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap_err();
    assert!(matches!(err, MasternodeError::OutOfRange(_)));
}

#[test]
fn low_ranked_future_voter_rejected_without_penalty() {
    let (ctx, chain, _utxo, fixtures) = election_setup(100);
    let height = 110;
    let peer = "8.8.8.8:9999".parse().unwrap();

    let ranked = ctx
        .registry
        .ranks(height - 101, ctx.params.min_protocol_version, &chain, &ctx.sync)
        .unwrap();
    // With twelve masternodes the worst rank is 12, inside 2x the limit, so
    // the vote is rejected without a penalty.
    let (rank, worst) = ranked.last().unwrap();
    assert!(*rank > SIGNATURES_TOTAL && *rank <= SIGNATURES_TOTAL * 2);
    let voter = fixture_for(&fixtures, &worst.outpoint);
    let vote = voter.vote(height, vec![0x00, 0x14, 9], &chain, &ctx.params);
    let err = ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap_err();
    assert!(matches!(err, MasternodeError::OutOfRange(_)));
    assert!(misbehaves(&ctx.drain_net_events()).is_empty());
}

#[test]
fn tie_breaks_by_last_paid_then_activation() {
    let params = MasternodeParams::default();
    let chain = MockChain::new(300, T0);
    let mut utxo = MockUtxo::default();
    let ctx = synced_context(params.clone());

    let fixtures: Vec<MnFixture> = (1..=12).map(MnFixture::new).collect();
    for (index, fixture) in fixtures.iter().enumerate() {
        utxo.insert(fixture.outpoint.clone(), params.collateral_amount, 10);
        let mut entry = fixture.entry(T0 - 7_200, 10, MasternodeState::Enabled);
        match index {
            0 => entry.last_paid_primary_time = 1_000,
            1 => entry.last_paid_primary_time = 900,
            3 => entry.activation_height = 20,
            _ => {}
        }
        ctx.registry.add(entry, &utxo).unwrap();
    }
    ctx.election.set_cached_height(300);

    // Height 250: five votes each; the payee paid longest ago wins.
    let peer = "8.8.8.8:9999".parse().unwrap();
    for (index, voter) in fixtures[2..].iter().enumerate() {
        let payee = if index < 5 {
            fixtures[0].payee_script()
        } else {
            fixtures[1].payee_script()
        };
        let vote = voter.vote(250, payee, &chain, &params);
        ctx.election
            .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
            .unwrap();
    }
    let (best, _) = ctx.election.get_best_payee(250, &ctx.registry, &utxo).unwrap();
    assert_eq!(best, fixtures[1].payee_script());

    // Height 251: last-paid times equal, the earlier activation wins.
    for (index, voter) in fixtures[2..].iter().enumerate() {
        let payee = if index < 5 {
            fixtures[2].payee_script()
        } else {
            fixtures[3].payee_script()
        };
        let vote = voter.vote(251, payee, &chain, &params);
        ctx.election
            .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
            .unwrap();
    }
    let (best, activation) = ctx.election.get_best_payee(251, &ctx.registry, &utxo).unwrap();
    assert_eq!(best, fixtures[2].payee_script());
    assert_eq!(activation, 10);

    // No tally reached the required count, so any coinbase passes.
    assert!(SIGNATURES_REQUIRED > 5);
    let anything = vec![TxOutput { value: 1, script_pubkey: vec![0xff] }];
    assert!(ctx.election.is_transaction_valid(&anything, 250));
}

#[test]
fn second_vote_for_same_height_is_dropped() {
    let (ctx, chain, _utxo, fixtures) = election_setup(300);
    let peer = "8.8.8.8:9999".parse().unwrap();
    let voter = &fixtures[4];

    let vote = voter.vote(250, vec![0x01], &chain, &ctx.params);
    assert!(ctx
        .election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap());

    // Same height, different payee: silently dropped.
    let conflicting = voter.vote(250, vec![0x02], &chain, &ctx.params);
    let err = ctx
        .election
        .process_vote(Some(peer), conflicting, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap_err();
    assert!(matches!(err, MasternodeError::Duplicate));

    // Lower height: also dropped.
    let older = voter.vote(249, vec![0x03], &chain, &ctx.params);
    let err = ctx
        .election
        .process_vote(Some(peer), older, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap_err();
    assert!(matches!(err, MasternodeError::Duplicate));

    // Strictly higher height supersedes.
    let newer = voter.vote(251, vec![0x04], &chain, &ctx.params);
    assert!(ctx
        .election
        .process_vote(Some(peer), newer, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap());
}

#[test]
fn coinbase_filling_splits_the_masternode_share() {
    let (ctx, chain, utxo, _fixtures) = election_setup(100);

    let outputs = ctx
        .election
        .fill_block_payees(110, &ctx.registry, &chain, &utxo, &ctx.sync);
    assert_eq!(outputs.len(), 12);
    assert_eq!(outputs[0].value, ctx.params.primary_payment_max());
    let total: u64 = outputs.iter().map(|o| o.value).sum();
    assert_eq!(total, ctx.params.block_reward_masternode);
    for secondary in &outputs[1..] {
        assert!(secondary.value >= ctx.params.secondaries_min_amount);
    }
}

struct GovSchedule;

impl GovernanceView for GovSchedule {
    fn is_governance_block_height(&self, height: u64) -> bool {
        height % 100 == 0
    }
    fn is_governance_block_triggered(&self, _height: u64) -> bool {
        false
    }
    fn payments_limit(&self, _height: u64) -> u64 {
        1_000
    }
    fn is_valid_governance_block(&self, _o: &[TxOutput], _h: u64, _r: u64) -> bool {
        false
    }
}

#[test]
fn unsynced_block_value_checks_governance_bound_only() {
    let params = MasternodeParams::default();
    let chain = MockChain::new(300, T0);
    // Deliberately not synced.
    let ctx = MasternodeContext::new(params, None);
    let reward = 50_000u64;

    // Non-governance height: bounded by the plain reward.
    let over = vec![TxOutput { value: reward + 1, script_pubkey: vec![1] }];
    assert!(ctx
        .election
        .is_block_value_valid(&over, 201, reward, &chain, &NoGovernance, &ctx.sync)
        .is_err());

    // Governance height: only the governance ceiling applies while unsynced.
    let padded = vec![TxOutput { value: reward + 900, script_pubkey: vec![1] }];
    assert!(ctx
        .election
        .is_block_value_valid(&padded, 200, reward, &chain, &GovSchedule, &ctx.sync)
        .is_ok());
    let too_padded = vec![TxOutput { value: reward + 1_001, script_pubkey: vec![1] }];
    assert!(ctx
        .election
        .is_block_value_valid(&too_padded, 200, reward, &chain, &GovSchedule, &ctx.sync)
        .is_err());

    // And payee checks are skipped entirely.
    assert!(ctx
        .election
        .is_block_payee_valid(&over, 201, reward, &chain, &NoGovernance, &ctx.sync));
}

#[test]
fn payment_enforcement_follows_checkpoint_guard() {
    let (ctx, chain, _utxo, fixtures) = election_setup(100);
    let height = 110;
    let payee = fixtures[0].payee_script();
    let peer = "8.8.8.8:9999".parse().unwrap();

    for voter in top_voters(&ctx, &chain, &fixtures, height, SIGNATURES_REQUIRED) {
        let vote = voter.vote(height, payee.clone(), &chain, &ctx.params);
        ctx.election
            .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
            .unwrap();
    }

    let wrong = vec![TxOutput { value: 1, script_pubkey: vec![0x55] }];
    // No checkpoint: soft mode, the bad payee is tolerated.
    assert!(ctx
        .election
        .is_block_payee_valid(&wrong, height, 50_000, &chain, &NoGovernance, &ctx.sync));

    // Past the checkpoint guard the same coinbase is rejected.
    let mut guarded = MockChain::new(100, T0);
    guarded.checkpoint = Some(0);
    assert!(!ctx
        .election
        .is_block_payee_valid(&wrong, height, 50_000, &guarded, &NoGovernance, &ctx.sync));
}

fn payment_block_fetches(events: &[NetEvent], peer: SocketAddr) -> Vec<Inv> {
    events
        .iter()
        .filter_map(|e| match e {
            NetEvent::Send(addr, MasternodeMessage::GetData(invs)) if *addr == peer => {
                Some(invs.clone())
            }
            _ => None,
        })
        .flatten()
        .filter(|inv| inv.kind == InvKind::PaymentBlockPrimary)
        .collect()
}

#[test]
fn weak_payment_blocks_are_rerequested() {
    let (ctx, chain, utxo, fixtures) = election_setup(300);
    let peer: SocketAddr = "8.8.8.8:9999".parse().unwrap();

    // One lonely vote leaves height 250 without a credible tally...
    let weak = fixtures[0].vote(250, vec![0x01], &chain, &ctx.params);
    ctx.election
        .process_vote(Some(peer), weak, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap();
    // ...while six agreeing votes settle height 260.
    let payee = fixtures[1].payee_script();
    for voter in &fixtures[2..8] {
        let vote = voter.vote(260, payee.clone(), &chain, &ctx.params);
        ctx.election
            .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
            .unwrap();
    }
    ctx.drain_net_events();

    ctx.election
        .request_low_data_payment_blocks(peer, ctx.registry.size(), &chain, &ctx.sync);
    let fetched = payment_block_fetches(&ctx.drain_net_events(), peer);
    assert!(!fetched.is_empty());
    // Heights we know nothing about are fetched, and so is the weak one.
    assert!(fetched.contains(&Inv::new(InvKind::PaymentBlockPrimary, MockChain::hash_for(299))));
    assert!(fetched.contains(&Inv::new(InvKind::PaymentBlockPrimary, MockChain::hash_for(250))));
    // The settled height is not.
    assert!(!fetched.contains(&Inv::new(InvKind::PaymentBlockPrimary, MockChain::hash_for(260))));

    // The maintenance tick drives the same sweep, once per peer per interval.
    ctx.tick(&[peer], &chain, &utxo);
    assert!(!payment_block_fetches(&ctx.drain_net_events(), peer).is_empty());
    ctx.tick(&[peer], &chain, &utxo);
    assert!(payment_block_fetches(&ctx.drain_net_events(), peer).is_empty());
}

#[test]
fn old_votes_are_evicted_at_the_storage_limit() {
    let (ctx, chain, _utxo, fixtures) = election_setup(6_000);
    let peer = "8.8.8.8:9999".parse().unwrap();

    let vote = fixtures[0].vote(1_000, vec![0x01], &chain, &ctx.params);
    ctx.election
        .process_vote(Some(peer), vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap();
    assert!(ctx.election.has_block(1_000));

    // Advance the tip so the vote falls out of the window.
    ctx.election.set_cached_height(6_001);
    ctx.election.check_and_remove(ctx.registry.size(), &ctx.sync);
    assert!(!ctx.election.has_block(1_000));
    assert_eq!(ctx.election.vote_count(), 0);
}
