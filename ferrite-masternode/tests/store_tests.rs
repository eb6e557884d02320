mod common;

use common::{synced_context, MnFixture, MockChain, MockUtxo};

use ferrite_masternode::registry::RegistryDump;
use ferrite_masternode::{store, MasternodeError};
use ferrite_shared_types::masternode::MasternodeParams;
use std::fs;

const T0: i64 = 1_700_000_000;

#[test]
fn caches_round_trip_with_version_guard() {
    let params = MasternodeParams::default();
    let chain = MockChain::new(300, T0);
    let mut utxo = MockUtxo::default();
    let ctx = synced_context(params.clone());

    // State built through the real ingestion paths, not hand-made dumps.
    let fixture = MnFixture::new(1);
    utxo.insert(fixture.outpoint.clone(), params.collateral_amount, 100);
    let mnb = fixture.broadcast(&chain, T0 - 7_200, T0 - 10, &params);
    ctx.registry
        .update_from_broadcast(None, mnb, &chain, &utxo, &ctx.sync, None)
        .unwrap();
    ctx.election.set_cached_height(300);
    let vote = fixture.vote(250, vec![0x01], &chain, &params);
    ctx.election
        .process_vote(None, vote, false, &ctx.registry, &chain, &ctx.sync)
        .unwrap();

    let dir = std::env::temp_dir().join("ferrite-cache-round-trip");
    fs::create_dir_all(&dir).unwrap();
    ctx.save_caches(&dir).unwrap();

    // A fresh context restores the same registry and election state.
    let restored = synced_context(params);
    restored.load_caches(&dir).unwrap();
    assert_eq!(restored.registry.size(), 1);
    let entry = restored.registry.find(&fixture.outpoint).unwrap();
    assert_eq!(entry, ctx.registry.find(&fixture.outpoint).unwrap());
    assert_eq!(restored.election.vote_count(), 1);
    assert!(restored.election.has_block(250));

    // A dump written under another component's format tag is refused.
    let err = store::load::<RegistryDump>(&dir.join("mnpayments.dat"), &store::registry_magic())
        .unwrap_err();
    assert!(matches!(err, MasternodeError::Storage(_)));

    // Payload corruption trips the checksum.
    let registry_path = dir.join("mncache.dat");
    let mut bytes = fs::read(&registry_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&registry_path, &bytes).unwrap();
    let err =
        store::load::<RegistryDump>(&registry_path, &store::registry_magic()).unwrap_err();
    assert!(matches!(err, MasternodeError::Storage(_)));

    fs::remove_dir_all(&dir).ok();
}
