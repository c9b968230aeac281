use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use angine::{
    hooks::{CommitResult, ExecuteResult, Hook, HookError, Hooks},
    types::data_types::{CryptoHash, Height},
};

/// Transactions starting with this byte are rejected by [`HashChainApp`].
pub(crate) const INVALID_TX_PREFIX: u8 = 0xff;

struct Committed {
    height: Height,
    app_hash: CryptoHash,
    receipts_hash: CryptoHash,
}

/// An application whose state is a hash chain over every valid transaction it commits.
///
/// Committing a height it has already committed returns the same hashes again, like a real application
/// would after a restart.
#[derive(Clone)]
pub(crate) struct HashChainApp {
    committed: Arc<Mutex<Committed>>,
    executions: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
    fail_commits: Arc<AtomicBool>,
}

impl HashChainApp {
    pub(crate) fn new() -> HashChainApp {
        HashChainApp {
            committed: Arc::new(Mutex::new(Committed {
                height: Height::new(0),
                app_hash: CryptoHash::default(),
                receipts_hash: CryptoHash::default(),
            })),
            executions: Arc::new(AtomicUsize::new(0)),
            commits: Arc::new(AtomicUsize::new(0)),
            fail_commits: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn app_hash(&self) -> CryptoHash {
        self.committed.lock().unwrap().app_hash
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub(crate) fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst)
    }

    pub(crate) fn hooks(&self) -> Hooks {
        let executions = self.executions.clone();
        let committed = self.committed.clone();
        let commits = self.commits.clone();
        let fail_commits = self.fail_commits.clone();

        Hooks {
            on_execute: Hook::new(move |args| {
                executions.fetch_add(1, Ordering::SeqCst);
                let (invalid_txs, valid_txs) = args
                    .block
                    .map(|block| block.data.txs.clone())
                    .unwrap_or_default()
                    .into_iter()
                    .partition(|tx| tx.bytes().first() == Some(&INVALID_TX_PREFIX));
                Ok(ExecuteResult {
                    valid_txs,
                    invalid_txs,
                    error: None,
                })
            }),
            on_commit: Hook::new(move |args| {
                if fail_commits.load(Ordering::SeqCst) {
                    return Err(HookError::Failed("commit failure injected".into()));
                }
                let mut committed = committed.lock().unwrap();
                if args.height <= committed.height {
                    return Ok(CommitResult {
                        app_hash: committed.app_hash,
                        receipts_hash: committed.receipts_hash,
                    });
                }

                let mut chain = committed.app_hash.bytes().to_vec();
                let mut num_valid: u64 = 0;
                for tx in args.block.map(|block| block.data.txs.as_slice()).unwrap_or_default() {
                    if tx.bytes().first() != Some(&INVALID_TX_PREFIX) {
                        chain.extend_from_slice(tx.bytes());
                        num_valid += 1;
                    }
                }
                committed.height = args.height;
                committed.app_hash = CryptoHash::digest(&chain);
                committed.receipts_hash = CryptoHash::digest(&num_valid.to_le_bytes());
                commits.fetch_add(1, Ordering::SeqCst);

                Ok(CommitResult {
                    app_hash: committed.app_hash,
                    receipts_hash: committed.receipts_hash,
                })
            }),
            ..Hooks::default()
        }
    }
}
