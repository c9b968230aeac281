/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from the consensus and execution threads
//! and fires the handlers registered for them.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// For each event type, the default logger (if event logging is enabled) followed by the user's handler.
#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) new_round_step_handlers: Vec<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) new_round_handlers: Vec<HandlerPtr<NewRoundEvent>>,
    pub(crate) complete_proposal_handlers: Vec<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) polka_handlers: Vec<HandlerPtr<PolkaEvent>>,
    pub(crate) lock_handlers: Vec<HandlerPtr<LockEvent>>,
    pub(crate) unlock_handlers: Vec<HandlerPtr<UnlockEvent>>,
    pub(crate) relock_handlers: Vec<HandlerPtr<RelockEvent>>,
    pub(crate) timeout_propose_handlers: Vec<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) timeout_wait_handlers: Vec<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) new_block_handlers: Vec<HandlerPtr<NewBlockEvent>>,
    pub(crate) new_block_header_handlers: Vec<HandlerPtr<NewBlockHeaderEvent>>,
    pub(crate) tx_handlers: Vec<HandlerPtr<TxEvent>>,
}

/// Handlers the user registered through the [`NodeSpec`](crate::node::NodeSpec) builder.
#[derive(Default)]
pub(crate) struct UserEventHandlers {
    pub(crate) on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    pub(crate) on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) on_polka: Option<HandlerPtr<PolkaEvent>>,
    pub(crate) on_lock: Option<HandlerPtr<LockEvent>>,
    pub(crate) on_unlock: Option<HandlerPtr<UnlockEvent>>,
    pub(crate) on_relock: Option<HandlerPtr<RelockEvent>>,
    pub(crate) on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) on_vote: Option<HandlerPtr<VoteEvent>>,
    pub(crate) on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    pub(crate) on_new_block_header: Option<HandlerPtr<NewBlockHeaderEvent>>,
    pub(crate) on_tx: Option<HandlerPtr<TxEvent>>,
}

fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(user_handler);
    handlers
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user: UserEventHandlers) -> EventHandlers {
        EventHandlers {
            new_round_step_handlers: handlers(log_events, user.on_new_round_step),
            new_round_handlers: handlers(log_events, user.on_new_round),
            complete_proposal_handlers: handlers(log_events, user.on_complete_proposal),
            polka_handlers: handlers(log_events, user.on_polka),
            lock_handlers: handlers(log_events, user.on_lock),
            unlock_handlers: handlers(log_events, user.on_unlock),
            relock_handlers: handlers(log_events, user.on_relock),
            timeout_propose_handlers: handlers(log_events, user.on_timeout_propose),
            timeout_wait_handlers: handlers(log_events, user.on_timeout_wait),
            vote_handlers: handlers(log_events, user.on_vote),
            new_block_handlers: handlers(log_events, user.on_new_block),
            new_block_header_handlers: handlers(log_events, user.on_new_block_header),
            tx_handlers: handlers(log_events, user.on_tx),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.new_round_step_handlers.is_empty()
            && self.new_round_handlers.is_empty()
            && self.complete_proposal_handlers.is_empty()
            && self.polka_handlers.is_empty()
            && self.lock_handlers.is_empty()
            && self.unlock_handlers.is_empty()
            && self.relock_handlers.is_empty()
            && self.timeout_propose_handlers.is_empty()
            && self.timeout_wait_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.new_block_handlers.is_empty()
            && self.new_block_header_handlers.is_empty()
            && self.tx_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::NewRoundStep(event) => self.new_round_step_handlers.iter().for_each(|handler| handler(&event)),
            Event::NewRound(event) => self.new_round_handlers.iter().for_each(|handler| handler(&event)),
            Event::CompleteProposal(event) => self.complete_proposal_handlers.iter().for_each(|handler| handler(&event)),
            Event::Polka(event) => self.polka_handlers.iter().for_each(|handler| handler(&event)),
            Event::Lock(event) => self.lock_handlers.iter().for_each(|handler| handler(&event)),
            Event::Unlock(event) => self.unlock_handlers.iter().for_each(|handler| handler(&event)),
            Event::Relock(event) => self.relock_handlers.iter().for_each(|handler| handler(&event)),
            Event::TimeoutPropose(event) => self.timeout_propose_handlers.iter().for_each(|handler| handler(&event)),
            Event::TimeoutWait(event) => self.timeout_wait_handlers.iter().for_each(|handler| handler(&event)),
            Event::Vote(event) => self.vote_handlers.iter().for_each(|handler| handler(&event)),
            Event::NewBlock(event) => self.new_block_handlers.iter().for_each(|handler| handler(&event)),
            Event::NewBlockHeader(event) => self.new_block_header_handlers.iter().for_each(|handler| handler(&event)),
            Event::Tx(event) => self.tx_handlers.iter().for_each(|handler| handler(&event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone: the node is shutting down.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
