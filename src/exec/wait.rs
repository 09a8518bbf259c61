//! Exit caching and waiter wake-up.
//!
//! The reaper publishes the terminal state once; waiters block on a channel
//! whose only sender is dropped at publish time, so every current and
//! future waiter wakes with the same cached value.
use crate::config::types::{ProcessState, Result, TaskboxError};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// One-shot latch: closed once, observed by any number of receivers.
#[derive(Debug)]
pub struct Latch {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        guard.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        // Nothing is ever sent, so any return means disconnected or timed out
        self.receiver.recv_timeout(timeout).is_err() && self.is_closed()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-held handle that aborts a pending `wait`.
#[derive(Clone, Debug)]
pub struct CancelToken {
    latch: Arc<Latch>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            latch: Arc::new(Latch::new()),
        }
    }

    /// Wake waiters holding this token. The process is not touched.
    pub fn cancel(&self) {
        self.latch.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.latch.is_closed()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal process state, written once and shared by every waiter.
#[derive(Debug, Default)]
pub struct ExitWatch {
    state: OnceLock<ProcessState>,
    exited: Latch,
}

impl ExitWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the terminal state. Later calls are ignored.
    pub fn publish(&self, state: ProcessState) -> bool {
        let first = self.state.set(state).is_ok();
        if first {
            self.exited.close();
        }
        first
    }

    /// Wake waiters without a state; the process never ran.
    pub fn abandon(&self) {
        self.exited.close();
    }

    pub fn get(&self) -> Option<&ProcessState> {
        self.state.get()
    }

    /// Block until the state is published or `cancel` fires.
    pub fn wait(&self, cancel: &CancelToken) -> Result<ProcessState> {
        if let Some(state) = self.state.get() {
            return Ok(state.clone());
        }
        select! {
            recv(self.exited.receiver()) -> _ => {}
            recv(cancel.latch.receiver()) -> _ => {}
        }
        // Published wins over a simultaneous cancel
        match self.state.get() {
            Some(state) => Ok(state.clone()),
            None if self.exited.is_closed() => Err(TaskboxError::NotRunning),
            None => Err(TaskboxError::WaitCancelled),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcessState> {
        if self.state.get().is_none() {
            self.exited.wait_timeout(timeout);
        }
        self.state.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::thread;

    fn exited(pid: i32) -> ProcessState {
        let mut state = ProcessState::started(pid, Utc::now());
        state.exit_code = 3;
        state.completed_at = Some(Utc::now());
        state
    }

    #[test]
    fn test_all_waiters_see_same_state() {
        let watch = Arc::new(ExitWatch::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let watch = watch.clone();
                thread::spawn(move || watch.wait(&CancelToken::new()).unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(watch.publish(exited(42)));
        assert!(!watch.publish(exited(43)));

        for waiter in waiters {
            let state = waiter.join().unwrap();
            assert_eq!(state.pid, 42);
            assert_eq!(state.exit_code, 3);
        }
        assert_eq!(watch.wait(&CancelToken::new()).unwrap().pid, 42);
    }

    #[test]
    fn test_cancel_wakes_only_its_waiter() {
        let watch = Arc::new(ExitWatch::new());
        let token = CancelToken::new();

        let cancelled = {
            let (watch, token) = (watch.clone(), token.clone());
            thread::spawn(move || watch.wait(&token))
        };
        let patient = {
            let watch = watch.clone();
            thread::spawn(move || watch.wait(&CancelToken::new()))
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(
            cancelled.join().unwrap(),
            Err(TaskboxError::WaitCancelled)
        ));

        watch.publish(exited(7));
        assert_eq!(patient.join().unwrap().unwrap().pid, 7);
    }

    #[test]
    fn test_abandon_wakes_waiters_with_not_running() {
        let watch = Arc::new(ExitWatch::new());
        let waiter = {
            let watch = watch.clone();
            thread::spawn(move || watch.wait(&CancelToken::new()))
        };
        thread::sleep(Duration::from_millis(20));
        watch.abandon();
        assert!(matches!(waiter.join().unwrap(), Err(TaskboxError::NotRunning)));
    }

    #[test]
    fn test_wait_timeout() {
        let watch = ExitWatch::new();
        assert!(watch.wait_timeout(Duration::from_millis(10)).is_none());
        watch.publish(exited(9));
        assert_eq!(watch.wait_timeout(Duration::from_millis(10)).unwrap().pid, 9);
    }

    #[test]
    fn test_latch_closes_once() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(5)));
        assert!(latch.close());
        assert!(!latch.close());
        assert!(latch.wait_timeout(Duration::from_millis(5)));
    }
}
