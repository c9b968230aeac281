/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and shut down a node.
//!
//! A node is started in three steps:
//! 1. Build a [`Configuration`] with its builder.
//! 2. Build a [`NodeSpec`], passing in the configuration along with the node's [network](Network),
//!    [key-value store](KVStore), [mempool](Mempool), [private validator](PrivValidator), genesis document,
//!    and application hooks.
//! 3. Call [`NodeSpec::start`], which loads (or creates) the state, runs the handshake with the block store,
//!    and spawns the node's threads.
//!
//! ## Threads
//!
//! A running node consists of:
//! - The consensus thread, which runs the round state machine, and the ticker thread feeding it timeouts.
//! - The poller thread, which moves messages from the network into the consensus thread.
//! - The broadcast workers, which send the node's own messages to its peers.
//! - The event bus thread, if any event handler is registered or event logging is enabled.
//! - The supervisor thread, which receives [faults](Fault) and decides whether they stop the node.
//!
//! All of them are shut down and joined when the [`Node`] is dropped.

use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{
    block_store::KVBlockStore,
    consensus::{
        config::{ConsensusConfig, TimeoutParams},
        messages::ConsensusMessage,
        start_consensus,
        state::{Broadcaster, ConsensusState, OnUpdateStatus},
        ConsensusError,
    },
    error::{Fault, HasSeverity, Severity},
    event_bus::*,
    events::*,
    hooks::Hooks,
    logging::LogHandle,
    mempool::{Mempool, MempoolError},
    networking::{start_polling, BroadcastPool, Network},
    state::{
        execution::{BlockExecutable, BlockVerifier, DefaultBlockExecutable, DefaultBlockVerifier, ExecutionContext},
        handshake::handshake,
        kv_store::KVStore,
        State, StateError,
    },
    types::{
        block::Block,
        data_types::{Height, Tx},
        genesis::GenesisDoc,
        priv_validator::PrivValidator,
        validators::Validator,
    },
};

#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.wal_dir(...)`
    - `.log_events(...)`

    Optional:
    - `.wal_light(...)`
    - `.timeouts(...)`
    - `.block_size(...)`
    - `.block_part_size(...)`
    - `.broadcast_workers(...)`
    - `.broadcast_queue_capacity(...)`
    - `.future_msg_buffer_capacity(...)`
    - `.log(...)`
"))]
pub struct Configuration {
    #[builder(setter(into, doc = "Set the directory that holds the write-ahead log. Required."))]
    pub wal_dir: PathBuf,
    #[builder(default, setter(doc = "Do not write messages from peers to the write-ahead log. Optional, defaults to false."))]
    pub wal_light: bool,
    #[builder(default, setter(doc = "Set the timeouts of each round step. Optional, defaults to [TimeoutParams::default]."))]
    pub timeouts: TimeoutParams,
    #[builder(default = 500, setter(doc = "Set the maximum number of transactions in a proposed block. Optional, defaults to 500."))]
    pub block_size: usize,
    #[builder(default = 65536, setter(doc = "Set the size in bytes of the parts proposed blocks are split into. Optional, defaults to 65536."))]
    pub block_part_size: usize,
    #[builder(default = 4, setter(doc = "Set the number of threads that send messages to peers. Optional, defaults to 4."))]
    pub broadcast_workers: usize,
    #[builder(default = 1024, setter(doc = "Set the number of per-peer sends that may wait for a broadcast worker. Optional, defaults to 1024."))]
    pub broadcast_queue_capacity: usize,
    #[builder(default = 1024, setter(doc = "Set the maximum number of messages for future heights or rounds held back until the node catches up. Optional, defaults to 1024."))]
    pub future_msg_buffer_capacity: usize,
    #[builder(setter(doc = "Enable logging of events? Required."))]
    pub log_events: bool,
    #[builder(default, setter(doc = "Set the log target that the node's components log under. Optional, defaults to `angine`."))]
    pub log: LogHandle,
}

impl Configuration {
    fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            timeouts: self.timeouts,
            wal_dir: self.wal_dir.clone(),
            wal_light: self.wal_light,
            block_size: self.block_size,
            block_part_size: self.block_part_size,
            future_msg_buffer_capacity: self.future_msg_buffer_capacity,
        }
    }
}

#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.network(...)`
    - `.kv_store(...)`
    - `.mempool(...)`
    - `.priv_validator(...)`
    - `.genesis(...)`
    - `.configuration(...)`

    Optional:
    - `.hooks(...)`
    - `.verifier(...)`
    - `.executable(...)`
    - `.on_new_round_step(...)`
    - `.on_new_round(...)`
    - `.on_complete_proposal(...)`
    - `.on_polka(...)`
    - `.on_lock(...)`
    - `.on_unlock(...)`
    - `.on_relock(...)`
    - `.on_timeout_propose(...)`
    - `.on_timeout_wait(...)`
    - `.on_vote(...)`
    - `.on_new_block(...)`
    - `.on_new_block_header(...)`
    - `.on_tx(...)`
"))]
pub struct NodeSpec<K: KVStore, M: Mempool, N: Network + 'static> {
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network] trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the key-value store that holds the state and the block store. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the mempool that proposals are reaped from. Required."))]
    mempool: M,
    #[builder(setter(
        transform = |priv_validator: impl PrivValidator + 'static| Box::new(priv_validator) as Box<dyn PrivValidator>,
        doc = "Set the signer of the node's votes and proposals. Required."
    ))]
    priv_validator: Box<dyn PrivValidator>,
    #[builder(setter(doc = "Set the genesis document, used if the key-value store holds no state yet. Required."))]
    genesis: GenesisDoc,
    #[builder(setter(doc = "Set the [configuration](Configuration). Required."))]
    configuration: Configuration,
    #[builder(default, setter(doc = "Set the application's hooks. Optional, defaults to hooks that accept every transaction."))]
    hooks: Hooks,
    #[builder(
        default = Arc::new(DefaultBlockVerifier),
        setter(
            transform = |verifier: impl BlockVerifier + 'static| Arc::new(verifier) as Arc<dyn BlockVerifier>,
            doc = "Set the rule that decides whether a block may extend the chain. Optional."
        )
    )]
    verifier: Arc<dyn BlockVerifier>,
    #[builder(
        default = Box::new(DefaultBlockExecutable),
        setter(
            transform = |executable: impl BlockExecutable + 'static| Box::new(executable) as Box<dyn BlockExecutable>,
            doc = "Set the chain-level processing around block execution, e.g., validator set changes. Optional."
        )
    )]
    executable: Box<dyn BlockExecutable>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundStepEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundStepEvent>),
    doc = "Register a handler closure to be invoked after the node enters a round step. Optional."))]
    on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundEvent>),
    doc = "Register a handler closure to be invoked after the node starts a round. Optional."))]
    on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteProposalEvent>),
    doc = "Register a handler closure to be invoked after the node receives every part of a proposed block. Optional."))]
    on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PolkaEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PolkaEvent>),
    doc = "Register a handler closure to be invoked after the node sees +2/3 prevotes for a block or nil. Optional."))]
    on_polka: Option<HandlerPtr<PolkaEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LockEvent>),
    doc = "Register a handler closure to be invoked after the node locks on a block. Optional."))]
    on_lock: Option<HandlerPtr<LockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UnlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UnlockEvent>),
    doc = "Register a handler closure to be invoked after the node releases its lock. Optional."))]
    on_unlock: Option<HandlerPtr<UnlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RelockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RelockEvent>),
    doc = "Register a handler closure to be invoked after the node renews its lock in a later round. Optional."))]
    on_relock: Option<HandlerPtr<RelockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutProposeEvent>),
    doc = "Register a handler closure to be invoked after the node gives up waiting for a proposal. Optional."))]
    on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutWaitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutWaitEvent>),
    doc = "Register a handler closure to be invoked after the node stops waiting for straggling votes. Optional."))]
    on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the node counts a new vote. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewBlockEvent>),
    doc = "Register a handler closure to be invoked after the node commits a block. Optional."))]
    on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewBlockHeaderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewBlockHeaderEvent>),
    doc = "Register a handler closure to be invoked with the header of every committed block. Optional."))]
    on_new_block_header: Option<HandlerPtr<NewBlockHeaderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TxEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TxEvent>),
    doc = "Register a handler closure to be invoked for every executed transaction. Optional."))]
    on_tx: Option<HandlerPtr<TxEvent>>,
}

impl<K: KVStore, M: Mempool, N: Network + 'static> NodeSpec<K, M, N> {
    /// Load the state, reconcile it with the block store, and start all of the node's threads.
    pub fn start(self) -> Result<Node<K, M>, NodeError> {
        let log = self.configuration.log.clone();
        let consensus_config = self.configuration.consensus_config();

        let mut kv_store = self.kv_store;
        let mut state = State::get_or_make_genesis_state(&mut kv_store, self.genesis)?;

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            UserEventHandlers {
                on_new_round_step: self.on_new_round_step,
                on_new_round: self.on_new_round,
                on_complete_proposal: self.on_complete_proposal,
                on_polka: self.on_polka,
                on_lock: self.on_lock,
                on_unlock: self.on_unlock,
                on_relock: self.on_relock,
                on_timeout_propose: self.on_timeout_propose,
                on_timeout_wait: self.on_timeout_wait,
                on_vote: self.on_vote,
                on_new_block: self.on_new_block,
                on_new_block_header: self.on_new_block_header,
                on_tx: self.on_tx,
            },
        );
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let mut exec = ExecutionContext::new(
            kv_store.clone(),
            self.verifier.clone(),
            self.executable,
            self.hooks,
            event_publisher,
            log.child("state"),
        );
        let block_store = KVBlockStore::new(kv_store.clone());
        let mempool = Arc::new(self.mempool);
        handshake(&mut state, &mut exec, &block_store, &*mempool)?;
        log::info!(target: log.target(), "handshake done, state at height {}", state.last_block_height);

        let shared_state = Arc::new(Mutex::new(state.clone()));
        let on_update_status: OnUpdateStatus = Arc::new(Mutex::new(None));

        let (input_sender, input_receiver) = mpsc::channel();
        let broadcast_pool = BroadcastPool::start(
            self.network.clone(),
            self.configuration.broadcast_workers,
            self.configuration.broadcast_queue_capacity,
            log.child("broadcast"),
        );
        let broadcaster: Broadcaster = Box::new(move |msg: &ConsensusMessage| broadcast_pool.broadcast(msg));

        let consensus_state = ConsensusState::new(
            consensus_config,
            state,
            shared_state.clone(),
            exec,
            block_store.clone(),
            mempool.clone(),
            self.priv_validator,
            input_sender.clone(),
            Some(broadcaster),
            on_update_status.clone(),
            log.child("consensus"),
        )?;

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network, input_sender, poller_shutdown_receiver, log.child("poller"));

        let (fault_sender, fault_receiver) = mpsc::channel();
        let (consensus_shutdown, consensus_shutdown_receiver) = mpsc::channel();
        let consensus = start_consensus(consensus_state, input_receiver, consensus_shutdown_receiver, fault_sender);

        let (event_bus_shutdown, event_bus) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                (Some(shutdown), Some(start_event_bus(event_handlers, event_subscriber, shutdown_receiver)))
            }
            None => (None, None),
        };

        let (fatal_fault_sender, fatal_faults) = mpsc::channel();
        let (supervisor_shutdown, supervisor_shutdown_receiver) = mpsc::channel();
        let supervisor = start_supervisor(fault_receiver, fatal_fault_sender, supervisor_shutdown_receiver, log.child("supervisor"));

        Ok(Node {
            shared_state,
            block_store,
            mempool,
            verifier: self.verifier,
            on_update_status,
            fatal_faults,
            consensus: Some(consensus),
            consensus_shutdown,
            poller: Some(poller),
            poller_shutdown,
            event_bus,
            event_bus_shutdown,
            supervisor: Some(supervisor),
            supervisor_shutdown,
            log,
        })
    }
}

/// Spawn the supervisor thread. Recoverable faults are logged, fatal ones are also passed on to
/// [`Node::wait_fault`].
fn start_supervisor(
    faults: Receiver<Fault>,
    fatal_faults: Sender<Fault>,
    shutdown_signal: Receiver<()>,
    log: LogHandle,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match faults.recv_timeout(Duration::from_millis(10)) {
            Ok(fault) if fault.severity.is_fatal() => {
                log::error!(target: log.target(), "{}, node stopped", fault);
                let _ = fatal_faults.send(fault);
            }
            Ok(fault) => log::warn!(target: log.target(), "{}", fault),
            Err(RecvTimeoutError::Timeout) => (),
            // Every component that could fault has exited.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// A handle to the background threads of a running node. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Node<K: KVStore, M: Mempool> {
    shared_state: Arc<Mutex<State>>,
    block_store: KVBlockStore<K>,
    mempool: Arc<M>,
    verifier: Arc<dyn BlockVerifier>,
    on_update_status: OnUpdateStatus,
    fatal_faults: Receiver<Fault>,
    consensus: Option<JoinHandle<()>>,
    consensus_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    supervisor_shutdown: Sender<()>,
    log: LogHandle,
}

impl<K: KVStore, M: Mempool> Node<K, M> {
    /// A snapshot of the last committed state.
    pub fn state(&self) -> State {
        self.shared_state.lock().clone()
    }

    /// The height of the last committed block, and the validators of the block after it.
    pub fn get_validators(&self) -> (Height, Vec<Validator>) {
        let state = self.shared_state.lock();
        (state.last_block_height, state.validators.validators().cloned().collect())
    }

    /// Check `block` against the last committed state with the node's [`BlockVerifier`].
    pub fn validate_block(&self, block: &Block) -> Result<(), StateError> {
        let state = self.state();
        self.verifier.validate_block(&state, block)
    }

    /// Register a callback to be invoked on the consensus thread with every newly committed state,
    /// replacing any callback registered before.
    pub fn set_on_update_status(&self, callback: impl Fn(&State) + Send + 'static) {
        *self.on_update_status.lock() = Some(Box::new(callback));
    }

    /// Submit a transaction to the mempool.
    pub fn check_tx(&self, tx: Tx) -> Result<(), MempoolError> {
        self.mempool.check_tx(tx)
    }

    pub fn block_store(&self) -> &KVBlockStore<K> {
        &self.block_store
    }

    /// Block until a fault stops the node, or `timeout` passes.
    pub fn wait_fault(&self, timeout: Duration) -> Option<Fault> {
        self.fatal_faults.recv_timeout(timeout).ok()
    }
}

impl<K: KVStore, M: Mempool> Drop for Node<K, M> {
    fn drop(&mut self) {
        // The consensus thread stops first, so that nothing it publishes or broadcasts outlives the threads
        // that would carry it.
        let _ = self.consensus_shutdown.send(());
        if let Some(consensus) = self.consensus.take() {
            let _ = consensus.join();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }

        if let Some(shutdown) = &self.event_bus_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.supervisor_shutdown.send(());
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        log::info!(target: self.log.target(), "node stopped");
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

impl HasSeverity for NodeError {
    fn severity(&self) -> Severity {
        match self {
            NodeError::State(err) => err.severity(),
            NodeError::Consensus(err) => err.severity(),
        }
    }
}
