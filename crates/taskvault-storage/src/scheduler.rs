//! Background worker that runs sync cycles on an interval and on demand.
//!
//! The worker runs on a dedicated OS thread owned by one scheduler instance.
//! Triggers that arrive while a cycle is running collapse into a single
//! follow-up cycle.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sync::SyncEngine;
use crate::store::ChangeHook;

enum Command {
    Trigger,
    Shutdown,
}

#[derive(Debug)]
pub struct SyncScheduler {
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    engine: Arc<SyncEngine>,
}

impl SyncScheduler {
    /// Spawn the worker. With `run_immediately` the first cycle starts right
    /// away instead of after one interval.
    pub fn start(
        engine: Arc<SyncEngine>,
        interval: Duration,
        run_immediately: bool,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker_engine = Arc::clone(&engine);
        let worker = std::thread::Builder::new()
            .name("taskvault-sync".into())
            .spawn(move || sync_loop(&worker_engine, &rx, interval, run_immediately))?;

        engine.set_running(true);
        tracing::info!(
            interval_secs = interval.as_secs(),
            run_immediately,
            "[sync] scheduler started"
        );
        Ok(Self {
            tx,
            worker: Some(worker),
            engine,
        })
    }

    /// Ask for a cycle soon. Never blocks.
    pub fn trigger(&self) {
        let _ = self.tx.send(Command::Trigger);
    }

    /// A cloneable hook that triggers this scheduler.
    pub fn trigger_hook(&self) -> ChangeHook {
        let tx = self.tx.clone();
        Arc::new(move || {
            let _ = tx.send(Command::Trigger);
        })
    }

    /// Cancel any in-flight network step and wait for the worker to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.engine.set_cancelled(true);
        let _ = self.tx.send(Command::Shutdown);
        if worker.join().is_err() {
            tracing::warn!("[sync] scheduler thread panicked");
        }
        self.engine.set_cancelled(false);
        self.engine.set_running(false);
        tracing::info!("[sync] scheduler stopped");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sync_loop(engine: &SyncEngine, rx: &Receiver<Command>, interval: Duration, mut pending: bool) {
    loop {
        if pending {
            // Errors are recorded in the engine's status and logged there.
            let _ = engine.sync_now();
        }
        match rx.recv_timeout(interval) {
            Ok(Command::Trigger) => {
                // Collapse any queued triggers into this one cycle.
                loop {
                    match rx.try_recv() {
                        Ok(Command::Trigger) => {}
                        Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => return,
                        Err(mpsc::TryRecvError::Empty) => break,
                    }
                }
                pending = true;
            }
            Err(RecvTimeoutError::Timeout) => pending = true,
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
