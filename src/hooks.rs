/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Callbacks through which consensus and the block execution pipeline call into the application.
//!
//! A [`Hook`] can be invoked in two ways:
//! - [`sync`](Hook::sync) runs the callback and blocks until it returns. Block execution uses this for
//!   `on_execute` and `on_commit`, whose results it needs.
//! - [`spawn`](Hook::spawn) runs the callback on a new thread and returns immediately. The round state
//!   machine uses this for its step notifications.
//!
//! Either way, completion is signalled on a one-slot channel that [`wait_done`](Hook::wait_done) blocks on.
//! [`sync`](Hook::sync) drains the channel before running, so a stale completion is never mistaken for the
//! current one.

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;

use crate::{
    error::{HasSeverity, Severity},
    types::{
        block::Block,
        data_types::{CryptoHash, Height, Round, Tx},
    },
};

/// The position of the caller, and the block the hook is about, if any.
#[derive(Clone, Copy)]
pub struct HookArgs<'a> {
    pub height: Height,
    pub round: Round,
    pub block: Option<&'a Block>,
}

pub type HookFn<R> = Arc<dyn Fn(HookArgs) -> Result<R, HookError> + Send + Sync>;

pub struct Hook<R: Send + 'static> {
    callback: HookFn<R>,
    done_sender: SyncSender<()>,
    done_receiver: Receiver<()>,
}

impl<R: Send + 'static> Hook<R> {
    pub fn new(callback: impl Fn(HookArgs) -> Result<R, HookError> + Send + Sync + 'static) -> Hook<R> {
        let (done_sender, done_receiver) = mpsc::sync_channel(1);
        Hook {
            callback: Arc::new(callback),
            done_sender,
            done_receiver,
        }
    }

    /// Run the callback on the calling thread's behalf and wait for its result. A panicking callback is
    /// reported as [`HookError::Panicked`].
    pub fn sync(&self, args: HookArgs) -> Result<R, HookError> {
        while self.done_receiver.try_recv().is_ok() {}

        let callback = &self.callback;
        let result = thread::scope(|s| s.spawn(move || callback(args)).join());
        let _ = self.done_sender.try_send(());
        result.unwrap_or(Err(HookError::Panicked))
    }

    /// Run the callback on a new thread.
    pub fn spawn(&self, height: Height, round: Round, block: Option<Block>) -> JoinHandle<Result<R, HookError>> {
        let callback = self.callback.clone();
        let done_sender = self.done_sender.clone();
        thread::spawn(move || {
            let result = callback(HookArgs {
                height,
                round,
                block: block.as_ref(),
            });
            let _ = done_sender.try_send(());
            result
        })
    }

    /// Block until an invocation completes, or `timeout` passes. Returns whether one completed.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        self.done_receiver.recv_timeout(timeout).is_ok()
    }
}

impl Hook<()> {
    pub fn noop() -> Hook<()> {
        Hook::new(|_| Ok(()))
    }
}

/// How the application partitioned a block's transactions when executing it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    pub valid_txs: Vec<Tx>,
    pub invalid_txs: Vec<Tx>,
    /// Set if the block as a whole could not be executed.
    pub error: Option<String>,
}

/// The application's state commitments after committing a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitResult {
    pub app_hash: CryptoHash,
    pub receipts_hash: CryptoHash,
}

pub struct Hooks {
    pub on_new_round: Hook<()>,
    pub on_propose: Hook<()>,
    pub on_prevote: Hook<()>,
    pub on_precommit: Hook<()>,
    pub on_execute: Hook<ExecuteResult>,
    pub on_commit: Hook<CommitResult>,
}

impl Default for Hooks {
    /// Hooks for an application that accepts every transaction and keeps no state.
    fn default() -> Self {
        Hooks {
            on_new_round: Hook::noop(),
            on_propose: Hook::noop(),
            on_prevote: Hook::noop(),
            on_precommit: Hook::noop(),
            on_execute: Hook::new(|args| {
                Ok(ExecuteResult {
                    valid_txs: args.block.map(|block| block.data.txs.clone()).unwrap_or_default(),
                    ..Default::default()
                })
            }),
            on_commit: Hook::new(|_| Ok(CommitResult::default())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(String),
    #[error("hook panicked")]
    Panicked,
}

impl HasSeverity for HookError {
    fn severity(&self) -> Severity {
        Severity::Crisis
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn args() -> HookArgs<'static> {
        HookArgs {
            height: Height::new(3),
            round: Round::new(1),
            block: None,
        }
    }

    #[test]
    fn sync_returns_callback_result() {
        let hook = Hook::new(|args: HookArgs| Ok(args.height.int() * 10 + args.round.int() as u64));
        assert_eq!(hook.sync(args()), Ok(31));
        // The completion signal of the call above is still pending.
        assert!(hook.wait_done(Duration::from_millis(10)));
    }

    #[test]
    fn panicking_callback_is_an_error() {
        let hook: Hook<()> = Hook::new(|_| panic!("application bug"));
        assert_eq!(hook.sync(args()), Err(HookError::Panicked));
        let failing: Hook<()> = Hook::new(|_| Err(HookError::Failed("no".into())));
        assert_eq!(failing.sync(args()), Err(HookError::Failed("no".into())));
    }

    #[test]
    fn spawn_signals_completion() {
        let calls = Arc::new(AtomicU64::new(0));
        let hook = {
            let calls = calls.clone();
            Hook::new(move |args: HookArgs| {
                calls.fetch_add(args.height.int(), Ordering::SeqCst);
                Ok(())
            })
        };
        let handle = hook.spawn(Height::new(7), Round::new(0), None);
        assert!(hook.wait_done(Duration::from_secs(5)));
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }
}
