// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("'{0}' not reached within {1:?}")]
    Timedout(String, Duration),
    #[error("background task '{0}' did not finish within {1:?}")]
    JoinTimeout(String, Duration),
    #[error("background task '{0}' panicked")]
    Panicked(String),
    #[error("spawning background task '{0}' failed")]
    Spawn(String, #[source] io::Error),
}

/// Polls `condition` every `interval` until it yields a value or `timeout`
/// elapses. The condition is always evaluated at least once.
pub fn wait_until<T, F>(
    description: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(v) = condition() {
            debug!("'{description}' reached after {:?}", start.elapsed());
            return Ok(v);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(WaitError::Timedout(description.to_owned(), timeout));
        }
        thread::sleep(interval.min(timeout - elapsed));
    }
}

/// Cooperative cancellation signal handed to a background task.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tracks a task independently from its result, so that an owner other than
/// the one holding the `BackgroundTask` can stop and wait for it.
#[derive(Clone)]
pub struct TaskWatcher {
    name: String,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl TaskWatcher {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stop_and_wait(&self, timeout: Duration) -> Result<(), WaitError> {
        self.stop.store(true, Ordering::SeqCst);
        wait_until(&self.name, timeout, Duration::from_millis(50), || {
            self.is_finished().then_some(())
        })
        .map_err(|_| WaitError::JoinTimeout(self.name.clone(), timeout))
    }
}

/// A scenario-local thread whose result is collected with a timeout.
pub struct BackgroundTask<T> {
    watcher: TaskWatcher,
    receiver: Receiver<thread::Result<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: &str, f: F) -> Result<Self, WaitError>
    where
        F: FnOnce(StopFlag) -> T + Send + 'static,
    {
        let (sender, receiver) = channel();
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let flag = StopFlag(stop.clone());
        let done = finished.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let output = panic::catch_unwind(AssertUnwindSafe(|| f(flag)));
                let _ = sender.send(output);
                done.store(true, Ordering::SeqCst);
            })
            .map_err(|e| WaitError::Spawn(name.to_owned(), e))?;

        Ok(BackgroundTask {
            watcher: TaskWatcher {
                name: name.to_owned(),
                stop,
                finished,
            },
            receiver,
            handle: Some(handle),
        })
    }

    pub fn watcher(&self) -> TaskWatcher {
        self.watcher.clone()
    }

    pub fn stop(&self) {
        self.watcher.stop.store(true, Ordering::SeqCst);
    }

    /// Waits for the task result. On timeout the thread is left detached,
    /// its stop flag raised.
    pub fn join_timeout(mut self, timeout: Duration) -> Result<T, WaitError> {
        let name = self.watcher.name.clone();
        match self.receiver.recv_timeout(timeout) {
            Ok(output) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                output.map_err(|_| WaitError::Panicked(name))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Background task '{name}' still running after {timeout:?}, detaching");
                self.stop();
                Err(WaitError::JoinTimeout(name, timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Panicked(name)),
        }
    }

    pub fn stop_and_join(self, timeout: Duration) -> Result<T, WaitError> {
        self.stop();
        self.join_timeout(timeout)
    }
}
