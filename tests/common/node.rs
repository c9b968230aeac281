use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use angine::{
    consensus::config::TimeoutParams,
    events::NewBlockEvent,
    logging::LogHandle,
    mempool::TxPool,
    node::{Configuration, Node, NodeSpec},
    types::{
        crypto_primitives::Keypair,
        data_types::{ChainID, CryptoHash, Height, Power},
        genesis::{GenesisDoc, GenesisValidator},
        priv_validator::LocalPrivValidator,
    },
};
use ed25519_dalek::SigningKey;

use super::{app::HashChainApp, logging::first_seven_base64_chars, mem_db::MemDB, network::NetworkStub};

pub(crate) fn keypair(index: u8) -> Keypair {
    Keypair::new(SigningKey::from_bytes(&[index + 1; 32]))
}

/// A genesis document in which the first `num_validators` keypairs each hold 10 voting power.
pub(crate) fn genesis(num_validators: u8) -> GenesisDoc {
    GenesisDoc {
        genesis_time: 1,
        chain_id: ChainID::new("angine-test"),
        validators: (0..num_validators)
            .map(|index| GenesisValidator {
                pub_key: keypair(index).public_bytes(),
                amount: Power::new(10),
                name: format!("validator-{}", index),
                is_ca: index == 0,
            })
            .collect(),
        app_hash: CryptoHash::default(),
        receipts_hash: CryptoHash::default(),
    }
}

pub(crate) fn fast_timeouts() -> TimeoutParams {
    TimeoutParams {
        propose0: 600,
        propose_delta: 200,
        prevote0: 200,
        prevote_delta: 100,
        precommit0: 200,
        precommit_delta: 100,
        commit0: 50,
        skip_timeout_commit: false,
    }
}

/// A node together with the pluggables it was started with, so that it can be restarted on the same
/// storage.
pub(crate) struct TestNode {
    pub(crate) name: String,
    pub(crate) kv_store: MemDB,
    pub(crate) app: HashChainApp,
    pub(crate) new_blocks: Arc<Mutex<Vec<(Height, CryptoHash)>>>,
    pub(crate) node: Node<MemDB, TxPool>,
}

impl TestNode {
    pub(crate) fn start(
        index: u8,
        network: NetworkStub,
        kv_store: MemDB,
        app: HashChainApp,
        wal_dir: &Path,
        genesis: GenesisDoc,
    ) -> TestNode {
        let name = format!("node-{}", index);
        let configuration = Configuration::builder()
            .wal_dir(wal_dir)
            .timeouts(fast_timeouts())
            .block_part_size(256)
            .broadcast_workers(2)
            .log_events(false)
            .log(LogHandle::new(&name))
            .build();

        let new_blocks = Arc::new(Mutex::new(Vec::new()));
        let node = NodeSpec::builder()
            .network(network)
            .kv_store(kv_store.clone())
            .mempool(TxPool::new(10_000))
            .priv_validator(LocalPrivValidator::new(keypair(index)))
            .genesis(genesis)
            .configuration(configuration)
            .hooks(app.hooks())
            .on_new_block(new_block_handler(name.clone(), new_blocks.clone()))
            .build()
            .start()
            .unwrap();

        TestNode {
            name,
            kv_store,
            app,
            new_blocks,
            node,
        }
    }

    pub(crate) fn height(&self) -> Height {
        self.node.state().last_block_height
    }
}

fn new_block_handler(
    name: String,
    new_blocks: Arc<Mutex<Vec<(Height, CryptoHash)>>>,
) -> impl Fn(&NewBlockEvent) + Send + 'static {
    move |event: &NewBlockEvent| {
        let hash = event.block.hash();
        log::debug!(
            "{}: new block at height {}, hash: {}",
            name,
            event.block.header.height,
            first_seven_base64_chars(&hash.bytes())
        );
        new_blocks.lock().unwrap().push((event.block.header.height, hash));
    }
}

/// Poll until every node has committed `height`. Panics after `timeout`.
pub(crate) fn wait_for_height(nodes: &[&TestNode], height: u64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while nodes.iter().any(|node| node.height() < Height::new(height)) {
        if Instant::now() > deadline {
            let heights: Vec<String> = nodes.iter().map(|node| format!("{}: {}", node.name, node.height())).collect();
            panic!("timed out waiting for height {}, at {}", height, heights.join(", "));
        }
        thread::sleep(Duration::from_millis(50));
    }
}
