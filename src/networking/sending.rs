/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The broadcast worker pool, which fans the replica's own consensus messages out to peers.
//!
//! Each broadcast becomes one job per peer on a bounded queue, served by a fixed number of worker threads.
//! When the queue is full, [`broadcast`](BroadcastPool::broadcast) blocks until a worker frees a slot.

use std::{
    sync::{
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;

use super::network::{Network, PeerKey};
use crate::{consensus::messages::ConsensusMessage, logging::LogHandle};

struct Job {
    peer: PeerKey,
    message: ConsensusMessage,
}

pub(crate) struct BroadcastPool<N: Network + 'static> {
    network: N,
    jobs: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    log: LogHandle,
}

impl<N: Network + 'static> BroadcastPool<N> {
    pub(crate) fn start(network: N, workers: usize, queue_capacity: usize, log: LogHandle) -> BroadcastPool<N> {
        let (jobs, job_receiver) = mpsc::sync_channel(queue_capacity.max(1));
        let job_receiver = Arc::new(Mutex::new(job_receiver));
        let workers = (0..workers.max(1))
            .map(|_| {
                let network = network.clone();
                let job_receiver = job_receiver.clone();
                thread::spawn(move || worker_routine(network, job_receiver))
            })
            .collect();

        BroadcastPool {
            network,
            jobs: Some(jobs),
            workers,
            log,
        }
    }

    /// Queue `message` for every current peer.
    pub(crate) fn broadcast(&self, message: &ConsensusMessage) {
        let Some(jobs) = &self.jobs else { return };
        for peer in self.network.peers() {
            let job = Job {
                peer,
                message: message.clone(),
            };
            if jobs.send(job).is_err() {
                log::warn!(target: self.log.target(), "broadcast workers are gone, dropping message");
                return;
            }
        }
    }
}

impl<N: Network + 'static> Drop for BroadcastPool<N> {
    fn drop(&mut self) {
        // Closing the queue makes every worker exit once it is drained.
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_routine<N: Network>(mut network: N, job_receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = job_receiver.lock().recv();
        match job {
            Ok(Job { peer, message }) => network.send(&peer, message),
            Err(_) => return,
        }
    }
}
