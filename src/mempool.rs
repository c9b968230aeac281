/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Mempool`] pluggable, and [`TxPool`], a bounded in-memory implementation of it.
//!
//! Committing a block holds the mempool's lock across removing the block's transactions
//! ([`MempoolGuard::update`]) and the application's `on_commit` hook, so that no proposal can be reaped from
//! a pool that is half-way through a commit. If `on_commit` fails, the update is undone with
//! [`MempoolGuard::rollback`] before the lock is released.

use std::collections::{HashSet, VecDeque};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::{
    error::{HasSeverity, Severity},
    types::data_types::{CryptoHash, Height, Tx},
};

pub trait Mempool: Send + Sync + 'static {
    type Guard<'a>: MempoolGuard
    where
        Self: 'a;

    /// Lock the mempool against concurrent reaps and admissions.
    fn lock(&self) -> Self::Guard<'_>;

    /// Up to `max_txs` transactions, oldest first, for a new proposal. Does not remove them.
    fn reap(&self, max_txs: usize) -> Vec<Tx>;

    /// Admit a transaction into the pool.
    fn check_tx(&self, tx: Tx) -> Result<(), MempoolError>;

    fn size(&self) -> usize;
}

pub trait MempoolGuard {
    /// Remove `txs`, which were committed at `height`, from the pool.
    fn update(&mut self, height: Height, txs: &[Tx]);

    /// Undo the last [`update`](MempoolGuard::update) made through this guard.
    fn rollback(&mut self);
}

struct TxPoolInner {
    txs: VecDeque<Tx>,
    hashes: HashSet<CryptoHash>,
    height: Height,
}

/// An in-memory FIFO transaction pool that holds at most `capacity` transactions.
pub struct TxPool {
    inner: Mutex<TxPoolInner>,
    capacity: usize,
}

impl TxPool {
    pub fn new(capacity: usize) -> TxPool {
        TxPool {
            inner: Mutex::new(TxPoolInner {
                txs: VecDeque::new(),
                hashes: HashSet::new(),
                height: Height::new(0),
            }),
            capacity,
        }
    }

    /// Height of the last block whose transactions were removed from the pool.
    pub fn height(&self) -> Height {
        self.inner.lock().height
    }
}

impl Mempool for TxPool {
    type Guard<'a> = TxPoolGuard<'a>;

    fn lock(&self) -> TxPoolGuard<'_> {
        TxPoolGuard {
            inner: self.inner.lock(),
            undo: None,
        }
    }

    fn reap(&self, max_txs: usize) -> Vec<Tx> {
        self.inner.lock().txs.iter().take(max_txs).cloned().collect()
    }

    fn check_tx(&self, tx: Tx) -> Result<(), MempoolError> {
        let mut inner = self.inner.lock();
        if inner.txs.len() >= self.capacity {
            return Err(MempoolError::Full { capacity: self.capacity });
        }
        let hash = tx.hash();
        if !inner.hashes.insert(hash) {
            return Err(MempoolError::Duplicate { tx: hash });
        }
        inner.txs.push_back(tx);
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.lock().txs.len()
    }
}

struct Undo {
    height: Height,
    removed: Vec<(usize, Tx)>,
}

pub struct TxPoolGuard<'a> {
    inner: MutexGuard<'a, TxPoolInner>,
    undo: Option<Undo>,
}

impl MempoolGuard for TxPoolGuard<'_> {
    fn update(&mut self, height: Height, txs: &[Tx]) {
        let committed: HashSet<CryptoHash> = txs.iter().map(Tx::hash).collect();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.inner.txs.len());
        for (position, tx) in self.inner.txs.drain(..).enumerate() {
            if committed.contains(&tx.hash()) {
                removed.push((position, tx));
            } else {
                kept.push_back(tx);
            }
        }
        for (_, tx) in &removed {
            self.inner.hashes.remove(&tx.hash());
        }
        self.inner.txs = kept;
        self.undo = Some(Undo {
            height: self.inner.height,
            removed,
        });
        self.inner.height = height;
    }

    fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else { return };
        // Positions are ascending, so re-inserting in order restores the original queue.
        for (position, tx) in undo.removed {
            self.inner.hashes.insert(tx.hash());
            let position = position.min(self.inner.txs.len());
            self.inner.txs.insert(position, tx);
        }
        self.inner.height = undo.height;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("mempool is full ({capacity} transactions)")]
    Full { capacity: usize },
    #[error("transaction {tx} is already in the mempool")]
    Duplicate { tx: CryptoHash },
}

impl HasSeverity for MempoolError {
    fn severity(&self) -> Severity {
        Severity::Recoverable
    }
}
