/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The timeout ticker: a single re-armable timer running on its own thread.
//!
//! The round state machine asks for a timeout on every step transition through
//! [`schedule_timeout`](TimeoutTicker::schedule_timeout). The ticker keeps at most one timer armed: a new
//! request replaces it only if its (height, round, step) key is strictly greater than the armed one, so
//! that timeouts always fire in key order and a late request for an old step can never displace a
//! current one.
//!
//! Fired timeouts are sent on an unbounded channel, so a slow consumer never blocks the ticker.

use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::round_state::TimeoutInfo;
use crate::{
    logging::LogHandle,
    service::{Service, ServiceError, ServiceState},
};

/// Upper bound on how long the ticker thread sleeps before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct TimeoutTicker<T: From<TimeoutInfo> + Send + 'static> {
    state: ServiceState,
    log: LogHandle,
    tick_sender: Sender<TimeoutInfo>,
    tick_receiver: Option<Receiver<TimeoutInfo>>,
    tock_sender: Sender<T>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<Receiver<TimeoutInfo>>>,
}

impl<T: From<TimeoutInfo> + Send + 'static> TimeoutTicker<T> {
    /// Create a stopped ticker that will deliver fired timeouts into `tock_sender`.
    pub fn new(log: LogHandle, tock_sender: Sender<T>) -> TimeoutTicker<T> {
        let (tick_sender, tick_receiver) = mpsc::channel();
        TimeoutTicker {
            state: ServiceState::default(),
            log,
            tick_sender,
            tick_receiver: Some(tick_receiver),
            tock_sender,
            shutdown: None,
            thread: None,
        }
    }

    /// Ask for `ti` to fire after `ti.duration`. Never blocks. Requests made while the ticker is stopped
    /// are processed once it starts.
    pub fn schedule_timeout(&self, ti: TimeoutInfo) {
        let _ = self.tick_sender.send(ti);
    }
}

impl<T: From<TimeoutInfo> + Send + 'static> Service for TimeoutTicker<T> {
    fn name(&self) -> &'static str {
        "timeout_ticker"
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        let tick_receiver = self.tick_receiver.take().ok_or(ServiceError::AlreadyRunning { name: self.name() })?;
        self.state.start(self.name())?;

        let (shutdown, shutdown_receiver) = mpsc::channel();
        let tock_sender = self.tock_sender.clone();
        let log = self.log.clone();
        self.shutdown = Some(shutdown);
        self.thread = Some(thread::spawn(move || {
            timeout_routine(log, tick_receiver, tock_sender, shutdown_receiver)
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.state.stop(self.name())?;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            // Reclaim the request channel so that the ticker can be restarted.
            if let Ok(tick_receiver) = thread.join() {
                self.tick_receiver = Some(tick_receiver);
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl<T: From<TimeoutInfo> + Send + 'static> Drop for TimeoutTicker<T> {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn timeout_routine<T: From<TimeoutInfo>>(
    log: LogHandle,
    tick_receiver: Receiver<TimeoutInfo>,
    tock_sender: Sender<T>,
    shutdown_signal: Receiver<()>,
) -> Receiver<TimeoutInfo> {
    let mut armed: Option<TimeoutInfo> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return tick_receiver,
            Err(TryRecvError::Empty) => (),
        }

        let wait = deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(POLL_INTERVAL)
            .min(POLL_INTERVAL);

        match tick_receiver.recv_timeout(wait) {
            Ok(ti) => {
                if armed.is_some_and(|armed| ti.key() <= armed.key()) {
                    log::trace!(target: log.target(), "ignoring stale timeout request {}", ti);
                } else {
                    log::debug!(target: log.target(), "scheduled timeout {}", ti);
                    deadline = Some(Instant::now() + ti.duration);
                    armed = Some(ti);
                }
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return tick_receiver,
        }

        if let (Some(at), Some(ti)) = (deadline, armed) {
            if Instant::now() >= at {
                deadline = None;
                log::debug!(target: log.target(), "timed out {}", ti);
                let _ = tock_sender.send(ti.into());
            }
        }
    }
}
