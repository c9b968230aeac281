/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round state machine.
//!
//! [`ConsensusState`] runs on a single thread and consumes three kinds of input: its own messages (from an
//! internal queue), messages from peers, and fired timeouts. Every input is written to the write-ahead log
//! before it is acted upon, and every step transition is written to the log before anything else
//! happens, so that replaying the log from the current height's checkpoint brings a restarted replica back
//! to where it was.
//!
//! ## Transitions
//!
//! Each `enter_*` method is guarded: it does nothing unless the machine is at the expected height and has
//! not already reached the step in the given round. This makes it safe to call them eagerly whenever a
//! vote or proposal might enable a transition.
//!
//! ```text
//! NewHeight -> NewRound -> Propose -> Prevote -> (PrevoteWait) -> Precommit -> (PrecommitWait) -> Commit
//!                 ^                                                                  |
//!                 +------------------------- next round ------------------------------+
//! ```

use std::{
    collections::VecDeque,
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;

use super::{
    config::ConsensusConfig,
    height_vote_set::HeightVoteSet,
    messages::{BlockPartMessage, ConsensusInput, ConsensusMessage, MsgInfo},
    round_state::{RoundState, RoundStepType, TimeoutInfo},
    ticker::TimeoutTicker,
    wal::{WALMessage, Wal},
    ConsensusError,
};
use crate::{
    block_store::KVBlockStore,
    error::{HasSeverity, Severity},
    events::*,
    logging::LogHandle,
    mempool::Mempool,
    networking::PeerKey,
    service::Service,
    state::{execution::apply_block, execution::ExecutionContext, kv_store::KVStore, State},
    types::{
        block::{Block, BlockID, Commit},
        data_types::{now_millis, Height, Round},
        part_set::{Part, PartSet, PartSetHeader},
        priv_validator::PrivValidator,
        validators::ValidatorSet,
        vote::{Proposal, Vote, VoteType},
        vote_set::VoteSet,
    },
};

/// How long the receive loop waits for input before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sends the replica's own consensus messages to its peers.
pub(crate) type Broadcaster = Box<dyn Fn(&ConsensusMessage) + Send>;

pub(crate) type UpdateStatusFn = Box<dyn Fn(&State) + Send>;

/// The callback invoked with every newly committed state. Shared with the node, which can replace it.
pub(crate) type OnUpdateStatus = Arc<Mutex<Option<UpdateStatusFn>>>;

#[derive(Clone, Copy)]
enum StepHook {
    NewRound,
    Propose,
    Prevote,
    Precommit,
}

pub struct ConsensusState<K: KVStore, M: Mempool> {
    pub(super) config: ConsensusConfig,
    pub(super) log: LogHandle,
    pub(super) rs: RoundState,
    pub(super) state: State,
    shared_state: Arc<Mutex<State>>,
    pub(super) exec: ExecutionContext<K>,
    block_store: KVBlockStore<K>,
    mempool: Arc<M>,
    priv_validator: Box<dyn PrivValidator>,
    pub(super) wal: Wal,
    pub(super) ticker: TimeoutTicker<ConsensusInput>,
    internal_queue: VecDeque<MsgInfo>,
    future_msgs: VecDeque<MsgInfo>,
    /// Set while replaying the write-ahead log. Nothing is logged, signed, or broadcast in replay mode.
    pub(super) replay_mode: bool,
    broadcaster: Option<Broadcaster>,
    on_update_status: OnUpdateStatus,
}

impl<K: KVStore, M: Mempool> ConsensusState<K, M> {
    /// Create a round state machine at the height after `state`. Fired timeouts are delivered into
    /// `input_sender`, which should feed the same channel that peer messages arrive on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ConsensusConfig,
        state: State,
        shared_state: Arc<Mutex<State>>,
        exec: ExecutionContext<K>,
        block_store: KVBlockStore<K>,
        mempool: Arc<M>,
        priv_validator: Box<dyn PrivValidator>,
        input_sender: Sender<ConsensusInput>,
        broadcaster: Option<Broadcaster>,
        on_update_status: OnUpdateStatus,
        log: LogHandle,
    ) -> Result<ConsensusState<K, M>, ConsensusError> {
        let wal = Wal::new(log.child("wal"), &config.wal_dir, config.wal_light);
        let ticker = TimeoutTicker::new(log.child("ticker"), input_sender);
        let rs = RoundState {
            height: Height::new(0),
            round: Round::new(0),
            step: RoundStepType::NewHeight,
            start_time: 0,
            commit_time: 0,
            validators: ValidatorSet::default(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            votes: HeightVoteSet::new(state.chain_id.clone(), Height::new(0), ValidatorSet::default()),
            commit_round: None,
            last_commit: None,
            last_validators: ValidatorSet::default(),
        };

        let mut cs = ConsensusState {
            config,
            log,
            rs,
            state,
            shared_state,
            exec,
            block_store,
            mempool,
            priv_validator,
            wal,
            ticker,
            internal_queue: VecDeque::new(),
            future_msgs: VecDeque::new(),
            replay_mode: false,
            broadcaster,
            on_update_status,
        };
        cs.update_to_state()?;
        Ok(cs)
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Start the write-ahead log and the ticker, replay the current height from the log, and schedule
    /// round 0.
    pub(crate) fn start(&mut self) -> Result<(), ConsensusError> {
        self.wal.start()?;
        self.ticker.start()?;

        self.ensure_height_checkpoint()?;
        self.catchup_replay(self.rs.height)?;
        self.ensure_height_checkpoint()?;

        self.schedule_round0();
        log::info!(target: self.log.target(), "started at height {}, round {}, step {}", self.rs.height, self.rs.round, self.rs.step);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.ticker.is_running() {
            let _ = self.ticker.stop();
        }
        if self.wal.is_running() {
            let _ = self.wal.stop();
        }
    }

    /// Consume inputs until `shutdown` fires, or an input fails fatally.
    pub(crate) fn receive_routine(
        &mut self,
        input: &Receiver<ConsensusInput>,
        shutdown: &Receiver<()>,
    ) -> Result<(), ConsensusError> {
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(()),
                Err(TryRecvError::Empty) => (),
            }

            if let Some(msg_info) = self.internal_queue.pop_front() {
                self.process(ConsensusInput::Peer(msg_info))?;
                continue;
            }

            match input.recv_timeout(POLL_INTERVAL) {
                Ok(next) => self.process(next)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Handle one input, then re-deliver held-back messages for as long as the input (or the re-delivered
    /// messages) moved the machine to a new height or round.
    pub(crate) fn process(&mut self, input: ConsensusInput) -> Result<(), ConsensusError> {
        let mut position = (self.rs.height, self.rs.round);
        match input {
            ConsensusInput::Peer(msg_info) => self.handle_msg(msg_info)?,
            ConsensusInput::Timeout(ti) => self.handle_timeout(ti)?,
        }
        while (self.rs.height, self.rs.round) != position && !self.future_msgs.is_empty() {
            position = (self.rs.height, self.rs.round);
            let pending: Vec<MsgInfo> = self.future_msgs.drain(..).collect();
            for msg_info in pending {
                self.handle_msg(msg_info)?;
            }
        }
        Ok(())
    }

    /* ↓↓↓ Input handlers ↓↓↓ */

    pub(super) fn handle_msg(&mut self, msg_info: MsgInfo) -> Result<(), ConsensusError> {
        if !msg_info.is_own() && self.is_future(&msg_info.msg) {
            self.hold_back(msg_info);
            return Ok(());
        }
        if !self.replay_mode {
            self.wal.save(&WALMessage::MsgInfo(msg_info.clone()))?;
        }

        let is_own = msg_info.is_own();
        let result = match &msg_info.msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal.clone()),
            ConsensusMessage::BlockPart(BlockPartMessage { height, part, .. }) => {
                self.add_proposal_block_part(*height, part.clone(), !is_own).map(|_| ())
            }
            ConsensusMessage::Vote(vote) => self.add_vote(vote.clone(), &msg_info.peer_key).map(|_| ()),
        };

        match result {
            Ok(()) => {
                if is_own && !self.replay_mode {
                    if let Some(broadcaster) = &self.broadcaster {
                        broadcaster(&msg_info.msg);
                    }
                }
                Ok(())
            }
            Err(err) if err.severity() == Severity::Recoverable => {
                log::warn!(
                    target: self.log.target(),
                    "ignoring message from {}: {}",
                    if is_own { "self" } else { msg_info.peer_key.as_str() },
                    err
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(super) fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            log::debug!(target: self.log.target(), "ignoring stale timeout {} (at {}/{}/{})", ti, rs.height, rs.round, rs.step);
            return Ok(());
        }
        if !self.replay_mode {
            self.wal.save(&WALMessage::Timeout(ti))?;
        }
        log::debug!(target: self.log.target(), "timeout {}", ti);

        let (height, round) = (ti.height, ti.round);
        match ti.step {
            RoundStepType::NewHeight => self.enter_new_round(height, Round::new(0)),
            RoundStepType::NewRound => self.enter_propose(height, round),
            RoundStepType::Propose => {
                self.publish(Event::TimeoutPropose(TimeoutProposeEvent {
                    timestamp: SystemTime::now(),
                    height,
                    round,
                }));
                self.enter_prevote(height, round)
            }
            RoundStepType::Prevote => self.enter_precommit(height, round),
            RoundStepType::PrevoteWait => {
                self.publish_timeout_wait(ti);
                self.enter_precommit(height, round)
            }
            RoundStepType::Precommit => self.enter_new_round(height, round.next()),
            RoundStepType::PrecommitWait => {
                self.publish_timeout_wait(ti);
                self.enter_new_round(height, round.next())
            }
            RoundStepType::Commit => self.try_finalize_commit(height),
        }
    }

    /// Whether a peer's message is for a later height, or is a proposal or block part for a later round of
    /// this height.
    fn is_future(&self, msg: &ConsensusMessage) -> bool {
        let height = msg.height();
        if height > self.rs.height {
            return true;
        }
        height == self.rs.height
            && msg.round() > self.rs.round
            && matches!(msg, ConsensusMessage::Proposal(_) | ConsensusMessage::BlockPart(_))
    }

    fn hold_back(&mut self, msg_info: MsgInfo) {
        let capacity = self.config.future_msg_buffer_capacity;
        if capacity == 0 {
            return;
        }
        if self.future_msgs.len() >= capacity {
            self.future_msgs.pop_front();
            log::debug!(target: self.log.target(), "future message buffer full, dropped the oldest message");
        }
        self.future_msgs.push_back(msg_info);
    }

    /* ↓↓↓ Step transitions ↓↓↓ */

    /// Record the current step: write it to the log, publish it, and schedule its timeout.
    fn new_step(&mut self) -> Result<(), ConsensusError> {
        let record = self.rs.record();
        if !self.replay_mode {
            self.wal.save(&WALMessage::RoundState(record))?;
        }
        log::debug!(target: self.log.target(), "entered {}/{}/{}", record.height, record.round, record.step);
        self.publish(Event::NewRoundStep(NewRoundStepEvent {
            timestamp: SystemTime::now(),
            height: record.height,
            round: record.round,
            step: record.step,
        }));
        self.ticker.schedule_timeout(self.step_timeout());
        Ok(())
    }

    fn step_timeout(&self) -> TimeoutInfo {
        let timeouts = &self.config.timeouts;
        let round = self.rs.round;
        let duration = match self.rs.step {
            RoundStepType::NewHeight => Duration::from_millis(self.rs.start_time.saturating_sub(now_millis())),
            RoundStepType::NewRound => Duration::ZERO,
            // Prevote and Precommit only time out if the machine stalls there.
            RoundStepType::Propose | RoundStepType::Prevote | RoundStepType::Precommit => timeouts.propose(round),
            RoundStepType::PrevoteWait => timeouts.prevote(round),
            RoundStepType::PrecommitWait => timeouts.precommit(round),
            RoundStepType::Commit => Duration::from_millis(timeouts.commit0),
        };
        TimeoutInfo {
            duration,
            height: self.rs.height,
            round,
            step: self.rs.step,
        }
    }

    pub(super) fn schedule_round0(&self) {
        self.ticker.schedule_timeout(TimeoutInfo {
            duration: Duration::from_millis(self.rs.start_time.saturating_sub(now_millis())),
            height: self.rs.height,
            round: Round::new(0),
            step: RoundStepType::NewHeight,
        });
    }

    pub(super) fn enter_new_round(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step != RoundStepType::NewHeight) {
            return Ok(());
        }
        if now_millis() < rs.start_time {
            log::debug!(target: self.log.target(), "entering round {} of height {} before its start time", round, height);
        }

        let mut validators = self.rs.validators.clone();
        if round > self.rs.round {
            validators.increment_accum(round - self.rs.round);
        }

        self.rs.round = round;
        self.rs.step = RoundStepType::NewRound;
        self.rs.validators = validators;
        if round.int() != 0 {
            // Round 0 keeps a proposal that arrived while waiting out the commit timeout.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs
            .votes
            .set_round(round.next())
            .map_err(|_| ConsensusError::Invariant("vote set round went backwards"))?;

        self.new_step()?;
        self.publish(Event::NewRound(NewRoundEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            proposer: self.rs.validators.proposer().map(|v| v.address),
        }));
        self.notify(StepHook::NewRound, None);

        self.enter_propose(height, round)
    }

    fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= RoundStepType::Propose) {
            return Ok(());
        }

        self.rs.step = RoundStepType::Propose;
        self.new_step()?;

        if self.is_proposer() {
            log::debug!(target: self.log.target(), "our turn to propose at {}/{}", height, round);
            self.decide_proposal(height, round)?;
        }

        if self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
        }
        Ok(())
    }

    fn is_proposer(&self) -> bool {
        self.rs.validators.proposer().map(|v| v.address) == Some(self.priv_validator.address())
    }

    fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        if self.replay_mode {
            return Ok(());
        }

        let (block, parts) = match (&self.rs.locked_block, &self.rs.locked_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.create_proposal_block(height) {
                Some(block) => {
                    let parts = block.make_part_set(self.config.block_part_size);
                    (block, parts)
                }
                None => return Ok(()),
            },
        };

        let pol = self.rs.votes.pol_info();
        let mut proposal = Proposal::new(
            height,
            round,
            parts.header(),
            pol.map(|(pol_round, _)| pol_round),
            pol.and_then(|(_, pol_block_id)| pol_block_id),
        );
        if let Err(err) = self.priv_validator.sign_proposal(&self.state.chain_id, &mut proposal) {
            log::warn!(target: self.log.target(), "cannot sign proposal for {}/{}: {}", height, round, err);
            return Ok(());
        }

        self.send_internal(ConsensusMessage::Proposal(proposal));
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index) {
                self.send_internal(ConsensusMessage::BlockPart(BlockPartMessage {
                    height,
                    round,
                    part: part.clone(),
                }));
            }
        }
        log::info!(target: self.log.target(), "proposing block {} at {}/{} with {} txs", block.hash(), height, round, block.header.num_txs);
        self.notify(StepHook::Propose, Some(block));
        Ok(())
    }

    fn create_proposal_block(&self, height: Height) -> Option<Block> {
        let last_commit = if height.int() == 1 {
            Commit::default()
        } else {
            match self.rs.last_commit.as_ref().and_then(VoteSet::make_commit) {
                Some(commit) => commit,
                None => {
                    log::error!(target: self.log.target(), "cannot propose at height {}: no commit for the previous block", height);
                    return None;
                }
            }
        };

        let txs = self.mempool.reap(self.config.block_size);
        Some(Block::make_block(
            self.priv_validator.address(),
            height,
            self.state.chain_id.clone(),
            now_millis(),
            txs,
            last_commit,
            self.state.last_block_id,
            self.state.validators.hash(),
            self.state.app_hash,
            self.state.receipts_hash,
            self.state.last_non_empty_height,
        ))
    }

    /// Whether we have the proposal, its whole block, and the polka it claims, if any.
    fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.rs.proposal, &self.rs.proposal_block) else {
            return false;
        };
        match proposal.pol_round {
            None => true,
            Some(pol_round) => self
                .rs
                .votes
                .prevotes(pol_round)
                .map_or(false, VoteSet::has_two_thirds_majority),
        }
    }

    fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= RoundStepType::Prevote) {
            return Ok(());
        }

        self.rs.step = RoundStepType::Prevote;
        self.new_step()?;
        self.do_prevote();
        Ok(())
    }

    fn do_prevote(&mut self) {
        if let (Some(block), Some(parts)) = (&self.rs.locked_block, &self.rs.locked_block_parts) {
            let block = block.clone();
            let block_id = BlockID {
                hash: block.hash(),
                parts_header: parts.header(),
            };
            self.sign_add_vote(VoteType::Prevote, Some(block_id));
            self.notify(StepHook::Prevote, Some(block));
            return;
        }

        let (Some(block), Some(parts)) = (&self.rs.proposal_block, &self.rs.proposal_block_parts) else {
            self.sign_add_vote(VoteType::Prevote, None);
            self.notify(StepHook::Prevote, None);
            return;
        };
        if let Err(err) = self.exec.verifier.validate_block(&self.state, block) {
            log::warn!(target: self.log.target(), "prevoting nil, proposal block {} is invalid: {}", block.hash(), err);
            self.sign_add_vote(VoteType::Prevote, None);
            self.notify(StepHook::Prevote, None);
            return;
        }

        let block = block.clone();
        let block_id = BlockID {
            hash: block.hash(),
            parts_header: parts.header(),
        };
        self.sign_add_vote(VoteType::Prevote, Some(block_id));
        self.notify(StepHook::Prevote, Some(block));
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= RoundStepType::PrevoteWait) {
            return Ok(());
        }
        if !rs.votes.prevotes(round).map_or(false, VoteSet::has_two_thirds_any) {
            return Err(ConsensusError::Invariant("entered prevote wait without +2/3 prevotes"));
        }

        self.rs.step = RoundStepType::PrevoteWait;
        self.new_step()
    }

    fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= RoundStepType::Precommit) {
            return Ok(());
        }

        self.rs.step = RoundStepType::Precommit;
        self.new_step()?;

        let polka = self.rs.votes.prevotes(round).and_then(VoteSet::two_thirds_majority);
        let Some(polka) = polka else {
            if self.rs.locked_block.is_some() {
                log::debug!(target: self.log.target(), "no polka in round {}, precommitting nil while locked", round);
            }
            self.sign_add_vote(VoteType::Precommit, None);
            self.notify(StepHook::Precommit, None);
            return Ok(());
        };

        self.publish(Event::Polka(PolkaEvent {
            timestamp: SystemTime::now(),
            height,
            round,
            block: polka.map(|block_id| block_id.hash),
        }));

        let Some(block_id) = polka else {
            // +2/3 prevoted nil.
            if self.rs.locked_block.is_some() {
                self.unlock(height, round);
            }
            self.sign_add_vote(VoteType::Precommit, None);
            self.notify(StepHook::Precommit, None);
            return Ok(());
        };

        if self.rs.locked_block.as_ref().map_or(false, |block| block.hashes_to(&block_id.hash)) {
            self.rs.locked_round = Some(round);
            self.publish(Event::Relock(RelockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                block: block_id.hash,
            }));
            self.sign_add_vote(VoteType::Precommit, Some(block_id));
            let locked_block = self.rs.locked_block.clone();
            self.notify(StepHook::Precommit, locked_block);
            return Ok(());
        }

        if let Some(block) = self.rs.proposal_block.clone().filter(|block| block.hashes_to(&block_id.hash)) {
            if self.exec.verifier.validate_block(&self.state, &block).is_err() {
                return Err(ConsensusError::Invariant("+2/3 prevoted for an invalid block"));
            }
            self.rs.locked_round = Some(round);
            self.rs.locked_block = Some(block.clone());
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.publish(Event::Lock(LockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                block: block_id.hash,
            }));
            self.sign_add_vote(VoteType::Precommit, Some(block_id));
            self.notify(StepHook::Precommit, Some(block));
            return Ok(());
        }

        // +2/3 prevoted a block we do not have. Fetch it, and precommit nil in the meantime.
        self.unlock(height, round);
        if !self
            .rs
            .proposal_block_parts
            .as_ref()
            .map_or(false, |parts| parts.has_header(&block_id.parts_header))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = self.expect_parts(block_id.parts_header);
        }
        self.sign_add_vote(VoteType::Precommit, None);
        self.notify(StepHook::Precommit, None);
        Ok(())
    }

    fn unlock(&mut self, height: Height, round: Round) {
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.publish(Event::Unlock(UnlockEvent {
            timestamp: SystemTime::now(),
            height,
            round,
        }));
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> Result<(), ConsensusError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step >= RoundStepType::PrecommitWait) {
            return Ok(());
        }
        if !rs.votes.precommits(round).map_or(false, VoteSet::has_two_thirds_any) {
            return Err(ConsensusError::Invariant("entered precommit wait without +2/3 precommits"));
        }

        self.rs.step = RoundStepType::PrecommitWait;
        self.new_step()
    }

    fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step >= RoundStepType::Commit {
            return Ok(());
        }
        let Some(Some(block_id)) = self.rs.votes.precommits(commit_round).and_then(VoteSet::two_thirds_majority) else {
            return Err(ConsensusError::Invariant("entered commit without +2/3 precommits for a block"));
        };

        self.rs.step = RoundStepType::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = now_millis();
        self.new_step()?;

        if self.rs.locked_block.as_ref().map_or(false, |block| block.hashes_to(&block_id.hash)) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !self.rs.proposal_block.as_ref().map_or(false, |block| block.hashes_to(&block_id.hash))
            && !self
                .rs
                .proposal_block_parts
                .as_ref()
                .map_or(false, |parts| parts.has_header(&block_id.parts_header))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = self.expect_parts(block_id.parts_header);
        }

        self.try_finalize_commit(height)
    }

    /// An empty part set to collect a block that +2/3 voted for, or `None` if its header asks for more
    /// parts than any valid block has.
    fn expect_parts(&self, header: PartSetHeader) -> Option<PartSet> {
        match PartSet::from_header(header, self.config.max_block_parts()) {
            Ok(parts) => Some(parts),
            Err(err) => {
                log::error!(target: self.log.target(), "not fetching voted block at height {}: {}", self.rs.height, err);
                None
            }
        }
    }

    fn try_finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height {
            return Err(ConsensusError::Invariant("finalizing a commit for another height"));
        }
        let Some(commit_round) = self.rs.commit_round else {
            return Ok(());
        };
        let Some(Some(block_id)) = self.rs.votes.precommits(commit_round).and_then(VoteSet::two_thirds_majority) else {
            return Ok(());
        };
        if !self.rs.proposal_block.as_ref().map_or(false, |block| block.hashes_to(&block_id.hash)) {
            log::debug!(target: self.log.target(), "waiting for block {} to finalize height {}", block_id.hash, height);
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: Height) -> Result<(), ConsensusError> {
        if self.rs.height != height || self.rs.step != RoundStepType::Commit {
            return Ok(());
        }
        let commit_round = self
            .rs
            .commit_round
            .ok_or(ConsensusError::Invariant("finalizing without a commit round"))?;
        let precommits = self
            .rs
            .votes
            .precommits(commit_round)
            .ok_or(ConsensusError::Invariant("finalizing without precommits"))?;
        let seen_commit = precommits
            .make_commit()
            .ok_or(ConsensusError::Invariant("finalizing without +2/3 precommits for a block"))?;
        let (Some(block), Some(parts)) = (self.rs.proposal_block.clone(), self.rs.proposal_block_parts.clone()) else {
            return Err(ConsensusError::Invariant("finalizing without the committed block"));
        };
        if seen_commit.block_id.map(|id| id.parts_header) != Some(parts.header()) {
            return Err(ConsensusError::Invariant("committed block parts do not match the commit"));
        }
        if self.exec.verifier.validate_block(&self.state, &block).is_err() {
            return Err(ConsensusError::Invariant("+2/3 committed an invalid block"));
        }

        log::info!(
            target: self.log.target(),
            "finalizing commit of block {} at height {} with {} txs",
            block.hash(),
            height,
            block.header.num_txs
        );

        if self.block_store.height()? < height {
            self.block_store.save_block(&block, &parts, &seen_commit)?;
        }

        let mut next_state = self.state.clone();
        apply_block(
            &mut next_state,
            &mut self.exec,
            &*self.mempool,
            &block,
            parts.header(),
            commit_round,
        )
        .map_err(ConsensusError::Finalize)?;

        self.publish(Event::NewBlockHeader(NewBlockHeaderEvent {
            timestamp: SystemTime::now(),
            header: block.header.clone(),
        }));
        self.publish(Event::NewBlock(NewBlockEvent {
            timestamp: SystemTime::now(),
            block,
        }));

        next_state.save(&mut self.exec.kv_store).map_err(ConsensusError::Finalize)?;
        *self.shared_state.lock() = next_state.clone();
        self.state = next_state;
        self.call_on_update_status();

        self.update_to_state()?;
        self.new_step()?;

        if self.config.timeouts.skip_timeout_commit
            && self.rs.last_commit.as_ref().map_or(false, VoteSet::has_all)
        {
            self.enter_new_round(self.rs.height, Round::new(0))?;
        }
        Ok(())
    }

    /// Reset the round state for the height after the committed state.
    fn update_to_state(&mut self) -> Result<(), ConsensusError> {
        let state = &self.state;
        let height = state.last_block_height + 1;

        let last_commit = if state.last_block_height.int() == 0 {
            None
        } else if let Some(commit_round) = self.rs.commit_round.filter(|_| self.rs.height == state.last_block_height) {
            self.rs.votes.precommits(commit_round).cloned()
        } else {
            match self.block_store.load_seen_commit(state.last_block_height)? {
                Some(commit) => Some(
                    VoteSet::from_commit(state.chain_id.clone(), &commit, state.last_validators.clone())
                        .map_err(|_| ConsensusError::Invariant("stored commit for the last block is invalid"))?,
                ),
                None => None,
            }
        };
        if state.last_block_height.int() > 0 && last_commit.is_none() {
            return Err(ConsensusError::Invariant("no commit for the last block"));
        }

        let start_time = if self.rs.commit_time == 0 {
            self.config.timeouts.commit(now_millis())
        } else {
            self.config.timeouts.commit(self.rs.commit_time)
        };
        let validators = state.validators.clone();

        self.rs = RoundState {
            height,
            round: Round::new(0),
            step: RoundStepType::NewHeight,
            start_time,
            commit_time: 0,
            votes: HeightVoteSet::new(state.chain_id.clone(), height, validators.clone()),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            commit_round: None,
            last_commit,
            last_validators: state.last_validators.clone(),
        };
        Ok(())
    }

    /* ↓↓↓ Proposals and votes ↓↓↓ */

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some()
            || proposal.height != self.rs.height
            || proposal.round != self.rs.round
            || self.rs.step >= RoundStepType::Commit
        {
            return Ok(());
        }
        if proposal.pol_round.map_or(false, |pol_round| pol_round >= proposal.round) {
            return Err(ConsensusError::InvalidProposalPolRound);
        }
        let proposer = self
            .rs
            .validators
            .proposer()
            .ok_or(ConsensusError::Invariant("validator set has no proposer"))?;
        if !proposal.is_correct(&self.state.chain_id, &proposer.pub_key) {
            return Err(ConsensusError::InvalidProposalSignature);
        }

        if self.rs.proposal_block_parts.is_none() {
            let parts = PartSet::from_header(proposal.block_parts_header, self.config.max_block_parts())?;
            self.rs.proposal_block_parts = Some(parts);
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    /// Returns whether the part was new.
    fn add_proposal_block_part(&mut self, height: Height, part: Part, verify: bool) -> Result<bool, ConsensusError> {
        if height != self.rs.height {
            return Ok(false);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            return Ok(false);
        };
        if !parts.add_part(part, verify)? || !parts.is_complete() {
            return Ok(true);
        }

        let block = Block::from_part_set(parts)?;
        self.publish(Event::CompleteProposal(CompleteProposalEvent {
            timestamp: SystemTime::now(),
            height,
            round: self.rs.round,
            block: block.hash(),
        }));
        self.rs.proposal_block = Some(block);

        if self.rs.step == RoundStepType::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        } else if self.rs.step == RoundStepType::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(true)
    }

    /// Returns whether the vote was new.
    fn add_vote(&mut self, vote: Vote, peer_key: &PeerKey) -> Result<bool, ConsensusError> {
        let height = self.rs.height;

        // A straggling precommit for the last block.
        if vote.height + 1 == height {
            if self.rs.step != RoundStepType::NewHeight || vote.vote_type != VoteType::Precommit {
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            let added = last_commit.add_vote(vote.clone()).map_err(ConsensusError::LastCommit)?;
            if added {
                let has_all = last_commit.has_all();
                self.publish(Event::Vote(VoteEvent {
                    timestamp: SystemTime::now(),
                    vote,
                }));
                if self.config.timeouts.skip_timeout_commit && has_all {
                    self.enter_new_round(height, Round::new(0))?;
                }
            }
            return Ok(added);
        }

        if vote.height != height {
            return Ok(false);
        }
        if !self.rs.votes.add_vote(vote.clone(), peer_key)? {
            return Ok(false);
        }
        let (vote_round, vote_type) = (vote.round, vote.vote_type);
        self.publish(Event::Vote(VoteEvent {
            timestamp: SystemTime::now(),
            vote,
        }));

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote_round)?,
            VoteType::Precommit => self.on_precommit_added(height, vote_round)?,
        }
        Ok(true)
    }

    fn on_prevote_added(&mut self, height: Height, vote_round: Round) -> Result<(), ConsensusError> {
        let Some(prevotes) = self.rs.votes.prevotes(vote_round) else {
            return Ok(());
        };
        let maj23 = prevotes.two_thirds_majority();
        let has_two_thirds_any = prevotes.has_two_thirds_any();

        // A polka for another block in a round after our lock releases the lock.
        let unlock = match (self.rs.locked_round, &self.rs.locked_block, maj23) {
            (Some(locked_round), Some(locked_block), Some(Some(block_id))) => {
                locked_round < vote_round && vote_round <= self.rs.round && !locked_block.hashes_to(&block_id.hash)
            }
            _ => false,
        };
        if unlock {
            log::info!(target: self.log.target(), "unlocking, saw a polka for another block in round {}", vote_round);
            self.unlock(height, vote_round);
        }

        if self.rs.round <= vote_round && has_two_thirds_any {
            self.enter_new_round(height, vote_round)?;
            if maj23.is_some() {
                self.enter_precommit(height, vote_round)?;
            } else {
                self.enter_prevote(height, vote_round)?;
                self.enter_prevote_wait(height, vote_round)?;
            }
        } else if self.rs.proposal.as_ref().and_then(|proposal| proposal.pol_round) == Some(vote_round)
            && self.is_proposal_complete()
        {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn on_precommit_added(&mut self, height: Height, vote_round: Round) -> Result<(), ConsensusError> {
        let Some(precommits) = self.rs.votes.precommits(vote_round) else {
            return Ok(());
        };
        let maj23 = precommits.two_thirds_majority();
        let has_two_thirds_any = precommits.has_two_thirds_any();
        let has_all = precommits.has_all();

        match maj23 {
            Some(Some(_)) => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit(height, vote_round)?;
                self.enter_commit(height, vote_round)?;
                if self.config.timeouts.skip_timeout_commit && has_all {
                    self.enter_new_round(self.rs.height, Round::new(0))?;
                }
            }
            Some(None) => self.enter_new_round(height, vote_round.next())?,
            None if self.rs.round <= vote_round && has_two_thirds_any => {
                self.enter_new_round(height, vote_round)?;
                self.enter_precommit(height, vote_round)?;
                self.enter_precommit_wait(height, vote_round)?;
            }
            None => (),
        }
        Ok(())
    }

    /// Sign a vote for the current height and round, and queue it for ourselves. Does nothing in replay
    /// mode, or if we are not a validator.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: Option<BlockID>) {
        if self.replay_mode {
            return;
        }
        let address = self.priv_validator.address();
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };

        let mut vote = Vote::new(address, index as u32, self.rs.height, self.rs.round, vote_type, block_id);
        match self.priv_validator.sign_vote(&self.state.chain_id, &mut vote) {
            Ok(()) => self.send_internal(ConsensusMessage::Vote(vote)),
            Err(err) => log::warn!(target: self.log.target(), "cannot sign {:?}: {}", vote_type, err),
        }
    }

    pub(super) fn clear_internal_queue(&mut self) {
        self.internal_queue.clear();
    }

    fn send_internal(&mut self, msg: ConsensusMessage) {
        self.internal_queue.push_back(MsgInfo {
            msg,
            peer_key: PeerKey::new(),
        });
    }

    /* ↓↓↓ Notifications ↓↓↓ */

    fn publish(&self, event: Event) {
        Event::publish(&self.exec.event_publisher, event);
    }

    fn publish_timeout_wait(&self, ti: TimeoutInfo) {
        self.publish(Event::TimeoutWait(TimeoutWaitEvent {
            timestamp: SystemTime::now(),
            height: ti.height,
            round: ti.round,
            step: ti.step,
        }));
    }

    /// Call the status callback without holding its lock, so that it may replace itself. A callback set
    /// while this one ran takes precedence over putting this one back.
    fn call_on_update_status(&self) {
        let Some(callback) = self.on_update_status.lock().take() else {
            return;
        };
        callback(&self.state);
        let mut slot = self.on_update_status.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }

    /// Run a step hook in the background. Hooks do not run again while the log is replayed.
    fn notify(&self, step_hook: StepHook, block: Option<Block>) {
        if self.replay_mode {
            return;
        }
        let hooks = &self.exec.hooks;
        let hook = match step_hook {
            StepHook::NewRound => &hooks.on_new_round,
            StepHook::Propose => &hooks.on_propose,
            StepHook::Prevote => &hooks.on_prevote,
            StepHook::Precommit => &hooks.on_precommit,
        };
        let _ = hook.spawn(self.rs.height, self.rs.round, block);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::mpsc::{self, Receiver},
    };

    use ed25519_dalek::SigningKey;
    use parking_lot::MutexGuard;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        consensus::config::TimeoutParams,
        hooks::Hooks,
        mempool::TxPool,
        state::{
            execution::{DefaultBlockExecutable, DefaultBlockVerifier},
            kv_store::{KVGet, WriteBatch},
        },
        types::{
            crypto_primitives::Keypair,
            data_types::{ChainID, CryptoHash, Power, Tx},
            genesis::{GenesisDoc, GenesisValidator},
            part_set::PartSetError,
            priv_validator::LocalPrivValidator,
        },
    };

    #[derive(Clone, Default)]
    struct MapStore(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

    struct MapBatch(Vec<(Vec<u8>, Option<Vec<u8>>)>);

    struct MapSnapshot<'a>(MutexGuard<'a, HashMap<Vec<u8>, Vec<u8>>>);

    impl KVStore for MapStore {
        type WriteBatch = MapBatch;
        type Snapshot<'a> = MapSnapshot<'a>;

        fn write(&mut self, wb: MapBatch) {
            let mut map = self.0.lock();
            for (key, value) in wb.0 {
                match value {
                    Some(value) => map.insert(key, value),
                    None => map.remove(&key),
                };
            }
        }

        fn clear(&mut self) {
            self.0.lock().clear();
        }

        fn snapshot<'b>(&'b self) -> MapSnapshot<'b> {
            MapSnapshot(self.0.lock())
        }
    }

    impl KVGet for MapStore {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.lock().get(key).cloned()
        }
    }

    impl KVGet for MapSnapshot<'_> {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.get(key).cloned()
        }
    }

    impl WriteBatch for MapBatch {
        fn new() -> Self {
            MapBatch(Vec::new())
        }

        fn set(&mut self, key: &[u8], value: &[u8]) {
            self.0.push((key.to_vec(), Some(value.to_vec())));
        }

        fn delete(&mut self, key: &[u8]) {
            self.0.push((key.to_vec(), None));
        }
    }

    const NUM_VALIDATORS: u8 = 4;

    fn keypair(index: u8) -> Keypair {
        Keypair::new(SigningKey::from_bytes(&[index + 1; 32]))
    }

    fn genesis() -> GenesisDoc {
        GenesisDoc {
            genesis_time: 1,
            chain_id: ChainID::new("consensus-state-test"),
            validators: (0..NUM_VALIDATORS)
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

    /// A started state machine for one of four equal validators, driven by hand. `me` is never the
    /// proposer of round 0. Peer messages are crafted and signed with the other validators' keys.
    struct Harness {
        cs: ConsensusState<MapStore, TxPool>,
        me: u8,
        sent: Arc<Mutex<Vec<ConsensusMessage>>>,
        events: Receiver<Event>,
        _timeouts: Receiver<ConsensusInput>,
        _wal_dir: TempDir,
    }

    impl Harness {
        fn new(future_msg_buffer_capacity: usize) -> Harness {
            let mut kv_store = MapStore::default();
            let state = State::get_or_make_genesis_state(&mut kv_store, genesis()).unwrap();
            let round0_proposer = state.validators.proposer().unwrap().address;
            let me = (0..NUM_VALIDATORS)
                .find(|index| keypair(*index).public_bytes().address() != round0_proposer)
                .unwrap();

            let wal_dir = tempfile::tempdir().unwrap();
            let config = ConsensusConfig {
                timeouts: TimeoutParams::default(),
                wal_dir: wal_dir.path().to_path_buf(),
                wal_light: false,
                block_size: 100,
                block_part_size: 64,
                future_msg_buffer_capacity,
            };
            let log = LogHandle::new("consensus-state-test");
            let (event_sender, events) = mpsc::channel();
            let exec = ExecutionContext::new(
                kv_store.clone(),
                Arc::new(DefaultBlockVerifier),
                Box::new(DefaultBlockExecutable),
                Hooks::default(),
                Some(event_sender),
                log.clone(),
            );
            let (input_sender, timeouts) = mpsc::channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            let broadcaster: Broadcaster = {
                let sent = sent.clone();
                Box::new(move |msg: &ConsensusMessage| sent.lock().push(msg.clone()))
            };

            let mut cs = ConsensusState::new(
                config,
                state.clone(),
                Arc::new(Mutex::new(state)),
                exec,
                KVBlockStore::new(kv_store),
                Arc::new(TxPool::new(100)),
                Box::new(LocalPrivValidator::new(keypair(me))),
                input_sender,
                Some(broadcaster),
                Arc::new(Mutex::new(None)),
                log,
            )
            .unwrap();
            cs.start().unwrap();

            Harness {
                cs,
                me,
                sent,
                events,
                _timeouts: timeouts,
                _wal_dir: wal_dir,
            }
        }

        fn others(&self) -> Vec<u8> {
            (0..NUM_VALIDATORS).filter(|index| *index != self.me).collect()
        }

        /// The proposer of `round` at the current height.
        fn proposer(&self, round: u32) -> u8 {
            let mut validators = self.cs.state.validators.clone();
            validators.increment_accum(round);
            let address = validators.proposer().unwrap().address;
            (0..NUM_VALIDATORS)
                .find(|index| keypair(*index).public_bytes().address() == address)
                .unwrap()
        }

        /// Handle a message from peer `from`, then everything the machine queued for itself.
        fn deliver(&mut self, msg: ConsensusMessage, from: u8) {
            let msg_info = MsgInfo {
                msg,
                peer_key: format!("peer-{}", from),
            };
            self.cs.process(ConsensusInput::Peer(msg_info)).unwrap();
            self.drain_internal();
        }

        /// Fire the timeout of `step` in the current round.
        fn fire(&mut self, step: RoundStepType) {
            let ti = TimeoutInfo {
                duration: Duration::ZERO,
                height: self.cs.rs.height,
                round: self.cs.rs.round,
                step,
            };
            self.cs.process(ConsensusInput::Timeout(ti)).unwrap();
            self.drain_internal();
        }

        fn drain_internal(&mut self) {
            while let Some(msg_info) = self.cs.internal_queue.pop_front() {
                self.cs.process(ConsensusInput::Peer(msg_info)).unwrap();
            }
        }

        fn vote_at(
            &self,
            from: u8,
            height: Height,
            round: u32,
            vote_type: VoteType,
            block_id: Option<BlockID>,
        ) -> ConsensusMessage {
            let key = keypair(from);
            let address = key.public_bytes().address();
            let (index, _) = self.cs.state.validators.get_by_address(&address).unwrap();
            let mut vote = Vote::new(address, index as u32, height, Round::new(round), vote_type, block_id);
            vote.signature = key.sign(&vote.sign_bytes(&self.cs.state.chain_id));
            ConsensusMessage::Vote(vote)
        }

        fn vote(&self, from: u8, round: u32, vote_type: VoteType, block_id: Option<BlockID>) -> ConsensusMessage {
            self.vote_at(from, self.cs.rs.height, round, vote_type, block_id)
        }

        fn deliver_votes(&mut self, from: &[u8], round: u32, vote_type: VoteType, block_id: Option<BlockID>) {
            for index in from {
                let vote = self.vote(*index, round, vote_type, block_id);
                self.deliver(vote, *index);
            }
        }

        /// A valid next block proposed in `round`, split into several parts.
        fn block(&self, round: u32, tx: &[u8]) -> (Block, PartSet, BlockID) {
            let state = &self.cs.state;
            let block = Block::make_block(
                keypair(self.proposer(round)).public_bytes().address(),
                state.last_block_height + 1,
                state.chain_id.clone(),
                state.last_block_time + 1,
                vec![Tx::new(tx.to_vec()); 8],
                Commit::default(),
                state.last_block_id,
                state.validators.hash(),
                state.app_hash,
                state.receipts_hash,
                state.last_non_empty_height,
            );
            let parts = block.make_part_set(self.cs.config.block_part_size);
            let block_id = BlockID {
                hash: block.hash(),
                parts_header: parts.header(),
            };
            (block, parts, block_id)
        }

        fn proposal(&self, round: u32, parts: &PartSet, pol_round: Option<u32>, signer: u8) -> Proposal {
            let height = self.cs.rs.height;
            let mut proposal = Proposal::new(height, Round::new(round), parts.header(), pol_round.map(Round::new), None);
            proposal.signature = keypair(signer).sign(&proposal.sign_bytes(&self.cs.state.chain_id));
            proposal
        }

        fn deliver_parts(&mut self, round: u32, parts: &PartSet, from: u8) {
            for index in 0..parts.total() {
                let part = parts.get_part(index).unwrap().clone();
                let msg = ConsensusMessage::BlockPart(BlockPartMessage {
                    height: self.cs.rs.height,
                    round: Round::new(round),
                    part,
                });
                self.deliver(msg, from);
            }
        }

        /// The proposer of `round` sends its proposal and every part of its block.
        fn deliver_proposal(&mut self, round: u32, parts: &PartSet) {
            let proposer = self.proposer(round);
            let proposal = self.proposal(round, parts, None, proposer);
            self.deliver(ConsensusMessage::Proposal(proposal), proposer);
            self.deliver_parts(round, parts, proposer);
        }

        /// Our own broadcast votes of `vote_type`, oldest first.
        fn sent_votes(&self, vote_type: VoteType) -> Vec<(Round, Option<BlockID>)> {
            self.sent
                .lock()
                .iter()
                .filter_map(|msg| match msg {
                    ConsensusMessage::Vote(vote) if vote.vote_type == vote_type => Some((vote.round, vote.block_id)),
                    _ => None,
                })
                .collect()
        }

        fn last_sent_vote(&self, vote_type: VoteType) -> Option<(Round, Option<BlockID>)> {
            self.sent_votes(vote_type).pop()
        }

        fn events(&self) -> Vec<Event> {
            self.events.try_iter().collect()
        }

        /// Start round 0, receive a proposal, and see +2/3 prevotes for it. Returns the locked block.
        fn lock_in_round_0(&mut self) -> BlockID {
            self.fire(RoundStepType::NewHeight);
            assert_eq!(self.cs.rs.step, RoundStepType::Propose);

            let (_, parts, block_id) = self.block(0, b"round-0");
            self.deliver_proposal(0, &parts);
            assert_eq!(self.cs.rs.step, RoundStepType::Prevote);
            assert_eq!(self.sent_votes(VoteType::Prevote), vec![(Round::new(0), Some(block_id))]);

            let others = self.others();
            self.deliver_votes(&others[..2], 0, VoteType::Prevote, Some(block_id));
            block_id
        }

        /// Move from round 0 to round 1 on +2/3 nil precommits from the others, then let the propose step
        /// time out if we are not the proposer of round 1.
        fn move_to_round_1(&mut self) {
            let others = self.others();
            self.deliver_votes(&others, 0, VoteType::Precommit, None);
            assert_eq!(self.cs.rs.round, Round::new(1));
            self.fire(RoundStepType::Propose);
            assert_eq!(self.cs.rs.step, RoundStepType::Prevote);
        }
    }

    #[test]
    fn polka_for_proposal_locks_it() {
        let mut h = Harness::new(16);
        let block_id = h.lock_in_round_0();

        assert_eq!(h.cs.rs.step, RoundStepType::Precommit);
        assert_eq!(h.cs.rs.locked_round, Some(Round::new(0)));
        assert!(h.cs.rs.locked_block.as_ref().unwrap().hashes_to(&block_id.hash));
        assert_eq!(h.sent_votes(VoteType::Precommit), vec![(Round::new(0), Some(block_id))]);
        assert!(h.events().iter().any(|event| matches!(event, Event::Lock(_))));
    }

    #[test]
    fn locked_block_is_prevoted_and_relocked_in_later_round() {
        let mut h = Harness::new(16);
        let block_id = h.lock_in_round_0();
        h.move_to_round_1();

        assert_eq!(h.last_sent_vote(VoteType::Prevote), Some((Round::new(1), Some(block_id))));
        assert_eq!(h.cs.rs.locked_round, Some(Round::new(0)));

        let others = h.others();
        h.deliver_votes(&others[..2], 1, VoteType::Prevote, Some(block_id));
        assert_eq!(h.cs.rs.step, RoundStepType::Precommit);
        assert_eq!(h.cs.rs.locked_round, Some(Round::new(1)));
        assert_eq!(h.last_sent_vote(VoteType::Precommit), Some((Round::new(1), Some(block_id))));
        assert!(h.events().iter().any(|event| matches!(event, Event::Relock(_))));
    }

    #[test]
    fn nil_polka_in_later_round_unlocks() {
        let mut h = Harness::new(16);
        h.lock_in_round_0();
        h.move_to_round_1();

        let others = h.others();
        h.deliver_votes(&others[..2], 1, VoteType::Prevote, None);
        assert_eq!(h.cs.rs.step, RoundStepType::PrevoteWait);
        assert_eq!(h.cs.rs.locked_round, Some(Round::new(0)));

        h.deliver_votes(&others[2..], 1, VoteType::Prevote, None);
        assert_eq!(h.cs.rs.step, RoundStepType::Precommit);
        assert_eq!(h.cs.rs.locked_round, None);
        assert!(h.cs.rs.locked_block.is_none());
        assert_eq!(h.last_sent_vote(VoteType::Precommit), Some((Round::new(1), None)));
        assert!(h.events().iter().any(|event| matches!(event, Event::Unlock(_))));
    }

    #[test]
    fn polka_for_unknown_block_in_later_round_unlocks_and_fetches_it() {
        let mut h = Harness::new(16);
        h.lock_in_round_0();
        h.move_to_round_1();

        let (other_block, other_parts, other_id) = h.block(1, b"round-1");
        let others = h.others();
        h.deliver_votes(&others, 1, VoteType::Prevote, Some(other_id));

        assert_eq!(h.cs.rs.step, RoundStepType::Precommit);
        assert!(h.cs.rs.locked_block.is_none());
        assert_eq!(h.last_sent_vote(VoteType::Precommit), Some((Round::new(1), None)));
        assert!(h.cs.rs.proposal_block.is_none());
        let fetching = h.cs.rs.proposal_block_parts.as_ref().unwrap();
        assert!(fetching.has_header(&other_id.parts_header));
        assert_eq!(fetching.count(), 0);

        h.deliver_parts(1, &other_parts, others[0]);
        assert_eq!(h.cs.rs.proposal_block.as_ref().map(Block::hash), Some(other_block.hash()));
    }

    #[test]
    fn precommits_for_unknown_block_fetch_it_then_commit() {
        let mut h = Harness::new(16);

        // The status callback replaces itself while it runs.
        let slot = h.cs.on_update_status.clone();
        let committed = Arc::new(Mutex::new(Vec::new()));
        let recorded = committed.clone();
        *h.cs.on_update_status.lock() = Some(Box::new(move |state: &State| {
            recorded.lock().push(state.last_block_height);
            *slot.lock() = Some(Box::new(|_: &State| ()));
        }));

        h.fire(RoundStepType::NewHeight);
        let (block, parts, block_id) = h.block(0, b"committed");
        let others = h.others();
        h.deliver_votes(&others, 0, VoteType::Precommit, Some(block_id));

        assert_eq!(h.cs.rs.step, RoundStepType::Commit);
        assert_eq!(h.cs.rs.commit_round, Some(Round::new(0)));
        assert!(h.cs.rs.proposal_block.is_none());
        assert!(h.cs.rs.proposal_block_parts.as_ref().unwrap().has_header(&block_id.parts_header));
        assert_eq!(h.cs.state.last_block_height, Height::new(0));

        h.deliver_parts(0, &parts, others[1]);
        assert_eq!(h.cs.state.last_block_height, Height::new(1));
        assert_eq!(h.cs.rs.height, Height::new(2));
        assert_eq!(h.cs.rs.step, RoundStepType::NewHeight);
        assert!(h.cs.rs.last_commit.is_some());
        assert_eq!(h.cs.shared_state.lock().last_block_height, Height::new(1));
        let stored = h.cs.block_store.load_block(Height::new(1)).unwrap().unwrap();
        assert_eq!(stored.hash(), block.hash());

        assert_eq!(*committed.lock(), vec![Height::new(1)]);
        assert!(h.cs.on_update_status.lock().is_some());
    }

    #[test]
    fn wait_timeouts_advance_to_precommit_and_next_round() {
        let mut h = Harness::new(16);
        h.fire(RoundStepType::NewHeight);
        h.fire(RoundStepType::Propose);
        assert_eq!(h.sent_votes(VoteType::Prevote), vec![(Round::new(0), None)]);

        let (_, _, somewhere_else) = h.block(0, b"elsewhere");
        let others = h.others();
        let nil = h.vote(others[0], 0, VoteType::Prevote, None);
        h.deliver(nil, others[0]);
        let split = h.vote(others[1], 0, VoteType::Prevote, Some(somewhere_else));
        h.deliver(split, others[1]);
        assert_eq!(h.cs.rs.step, RoundStepType::PrevoteWait);

        h.fire(RoundStepType::PrevoteWait);
        assert_eq!(h.cs.rs.step, RoundStepType::Precommit);
        assert_eq!(h.sent_votes(VoteType::Precommit), vec![(Round::new(0), None)]);
        assert!(h.events().iter().any(|event| matches!(event, Event::TimeoutWait(_))));

        let nil = h.vote(others[0], 0, VoteType::Precommit, None);
        h.deliver(nil, others[0]);
        let split = h.vote(others[1], 0, VoteType::Precommit, Some(somewhere_else));
        h.deliver(split, others[1]);
        assert_eq!(h.cs.rs.step, RoundStepType::PrecommitWait);

        h.fire(RoundStepType::PrecommitWait);
        assert_eq!(h.cs.rs.round, Round::new(1));
        assert!(h.cs.rs.step >= RoundStepType::Propose);
        assert!(h.cs.rs.locked_block.is_none());
    }

    #[test]
    fn proposal_with_pol_round_not_before_its_round_is_rejected() {
        let mut h = Harness::new(16);
        h.fire(RoundStepType::NewHeight);
        let (_, parts, _) = h.block(0, b"bad-pol");
        let proposer = h.proposer(0);

        let bad_pol = h.proposal(0, &parts, Some(0), proposer);
        assert!(matches!(
            h.cs.set_proposal(bad_pol.clone()),
            Err(ConsensusError::InvalidProposalPolRound)
        ));
        h.deliver(ConsensusMessage::Proposal(bad_pol), proposer);
        assert!(h.cs.rs.proposal.is_none());

        let wrong_signer = h.proposal(0, &parts, None, h.me);
        assert!(matches!(
            h.cs.set_proposal(wrong_signer),
            Err(ConsensusError::InvalidProposalSignature)
        ));
        assert!(h.cs.rs.proposal.is_none());
        assert!(h.cs.rs.proposal_block_parts.is_none());
        assert_eq!(h.cs.rs.step, RoundStepType::Propose);
    }

    #[test]
    fn proposal_with_oversized_part_set_is_rejected() {
        let mut h = Harness::new(16);
        h.fire(RoundStepType::NewHeight);
        let (_, parts, _) = h.block(0, b"huge");
        let proposer = h.proposer(0);

        let mut proposal = h.proposal(0, &parts, None, proposer);
        proposal.block_parts_header.total = h.cs.config.max_block_parts() + 1;
        proposal.signature = keypair(proposer).sign(&proposal.sign_bytes(&h.cs.state.chain_id));
        assert!(matches!(
            h.cs.set_proposal(proposal),
            Err(ConsensusError::BlockPart(PartSetError::InvalidTotal { .. }))
        ));
        assert!(h.cs.rs.proposal.is_none());
        assert!(h.cs.rs.proposal_block_parts.is_none());
    }

    #[test]
    fn future_messages_are_held_back_up_to_capacity() {
        let mut h = Harness::new(2);
        h.fire(RoundStepType::NewHeight);

        let others = h.others();
        for index in &others {
            let vote = h.vote_at(*index, Height::new(2), 0, VoteType::Prevote, None);
            h.deliver(vote, *index);
        }
        let held: Vec<&str> = h.cs.future_msgs.iter().map(|msg_info| msg_info.peer_key.as_str()).collect();
        let expected: Vec<String> = others[1..].iter().map(|index| format!("peer-{}", index)).collect();
        assert_eq!(held, expected);

        let mut h = Harness::new(0);
        h.fire(RoundStepType::NewHeight);
        let others = h.others();
        let vote = h.vote_at(others[0], Height::new(2), 0, VoteType::Prevote, None);
        h.deliver(vote, others[0]);
        assert!(h.cs.future_msgs.is_empty());
    }

    #[test]
    fn held_back_proposal_is_handled_once_its_round_starts() {
        let mut h = Harness::new(8);
        h.fire(RoundStepType::NewHeight);

        // The first later round that a peer proposes in.
        let round = (1..).find(|round| h.proposer(*round) != h.me).unwrap();
        let (_, parts, _) = h.block(round, b"later");
        let proposer = h.proposer(round);
        let proposal = h.proposal(round, &parts, None, proposer);
        h.deliver(ConsensusMessage::Proposal(proposal), proposer);
        assert!(h.cs.rs.proposal.is_none());
        assert_eq!(h.cs.future_msgs.len(), 1);

        let others = h.others();
        for earlier in 0..round {
            h.deliver_votes(&others, earlier, VoteType::Precommit, None);
        }
        assert_eq!(h.cs.rs.round, Round::new(round));
        assert_eq!(h.cs.rs.proposal.as_ref().map(|proposal| proposal.round), Some(Round::new(round)));
        assert!(h.cs.future_msgs.is_empty());
    }
}
