use std::time::Duration;

use angine::{
    mempool::MempoolError,
    types::data_types::{Height, Tx},
};
use log::LevelFilter;

mod common;

use crate::common::{
    app::{HashChainApp, INVALID_TX_PREFIX},
    logging::setup_logger,
    mem_db::MemDB,
    network::mock_network,
    node::{genesis, wait_for_height, TestNode},
};

#[test]
fn single_validator_commits_transactions() {
    setup_logger(LevelFilter::Debug);

    let wal_dir = tempfile::tempdir().unwrap();
    let network = mock_network(["node-0".to_string()].into_iter()).remove(0);
    let node = TestNode::start(0, network, MemDB::new(), HashChainApp::new(), wal_dir.path(), genesis(1));

    node.node.check_tx(Tx::new(b"alpha".to_vec())).unwrap();
    node.node.check_tx(Tx::new(b"beta".to_vec())).unwrap();
    node.node.check_tx(Tx::new(vec![INVALID_TX_PREFIX, 1])).unwrap();
    assert_eq!(
        node.node.check_tx(Tx::new(b"alpha".to_vec())),
        Err(MempoolError::Duplicate {
            tx: Tx::new(b"alpha".to_vec()).hash()
        })
    );

    wait_for_height(&[&node], 3, Duration::from_secs(20));

    // Every submitted transaction was committed in one of the blocks.
    let state = node.node.state();
    let committed: Vec<Tx> = (1..=state.last_block_height.int())
        .flat_map(|height| node.node.block_store().load_block(Height::new(height)).unwrap().unwrap().data.txs)
        .collect();
    assert_eq!(committed.len(), 3);
    assert!(state.last_non_empty_height.int() >= 1);

    // The application's hashes made it into the state.
    assert_eq!(state.app_hash, node.app.app_hash());
    assert_eq!(node.app.executions(), node.app.commits());
}

#[test]
fn four_validators_agree_on_every_block() {
    setup_logger(LevelFilter::Debug);

    let names: Vec<String> = (0..4).map(|index| format!("node-{}", index)).collect();
    let networks = mock_network(names.into_iter());
    let wal_dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
    let nodes: Vec<TestNode> = networks
        .into_iter()
        .enumerate()
        .map(|(index, network)| {
            TestNode::start(index as u8, network, MemDB::new(), HashChainApp::new(), wal_dirs[index].path(), genesis(4))
        })
        .collect();

    for i in 0..5u8 {
        nodes[usize::from(i) % 4].node.check_tx(Tx::new(vec![i; 16])).unwrap();
    }

    let node_refs: Vec<&TestNode> = nodes.iter().collect();
    wait_for_height(&node_refs, 4, Duration::from_secs(60));

    for height in 1..=4 {
        let height = Height::new(height);
        let metas: Vec<_> = nodes
            .iter()
            .map(|node| node.node.block_store().load_block_meta(height).unwrap().unwrap())
            .collect();
        assert!(metas.iter().all(|meta| meta.block_id == metas[0].block_id));
        assert!(metas.iter().all(|meta| meta.header.app_hash == metas[0].header.app_hash));
    }

    // Every node saw the committed blocks through its event handler, in height order.
    for node in &nodes {
        let new_blocks = node.new_blocks.lock().unwrap();
        assert!(new_blocks.len() >= 4);
        assert!(new_blocks.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    // Every node holds a commit for each block, signed by more than two thirds of the validators.
    for node in &nodes {
        let state = node.node.state();
        let commit = node
            .node
            .block_store()
            .load_seen_commit(Height::new(3))
            .unwrap()
            .unwrap();
        let signed = commit.precommits.iter().filter(|precommit| precommit.is_some()).count();
        assert!(signed >= 3);
        let (height, validators) = node.node.get_validators();
        assert!(height >= state.last_block_height);
        assert_eq!(validators.len(), 4);
        assert_eq!(state.validators.len(), 4);
    }
}
