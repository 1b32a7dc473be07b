// src/position/source.rs
//! Continuous position stream abstraction

use super::data::Position;
use crate::error::PositionErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

/// Acquisition options passed to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub max_sample_age_ms: u64,
    pub timeout_ms: u64,
}

impl PositionOptions {
    /// Defaults for a continuous watch: fresh fixes, 10 s per sample
    pub fn watch_defaults() -> Self {
        Self {
            high_accuracy: true,
            max_sample_age_ms: 1000,
            timeout_ms: 10_000,
        }
    }

    /// Defaults for a one-shot fix taken before a session starts
    pub fn one_shot_defaults() -> Self {
        Self {
            high_accuracy: true,
            max_sample_age_ms: 0,
            timeout_ms: 15_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Zero disables the staleness filter.
    pub fn max_sample_age(&self) -> Duration {
        Duration::from_millis(self.max_sample_age_ms)
    }
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self::watch_defaults()
    }
}

/// Item delivered by a running watch.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Sample(Position),
    Error(PositionErrorKind),
}

#[derive(Debug)]
struct HandleInner {
    active: AtomicBool,
    notify: Notify,
}

/// Cloneable stop switch for one watch.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    inner: Arc<HandleInner>,
}

impl WatchHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                active: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    /// Stop the watch. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);
        if was_active {
            self.inner.notify.notify_waiters();
        }
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }
}

/// Producer half used by source implementations.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<PositionEvent>,
    handle: WatchHandle,
}

impl WatchSender {
    /// Deliver an event. Returns `false` once the watch is stopped or dropped,
    /// at which point the producer should exit.
    pub async fn send(&self, event: PositionEvent) -> bool {
        if !self.handle.is_active() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.handle.stopped() => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active() && !self.tx.is_closed()
    }

    pub fn handle(&self) -> &WatchHandle {
        &self.handle
    }
}

/// Consumer half of a continuous position stream.
#[derive(Debug)]
pub struct Watch {
    rx: Option<mpsc::Receiver<PositionEvent>>,
    handle: WatchHandle,
}

impl Watch {
    pub fn channel(buffer: usize) -> (WatchSender, Watch) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = WatchHandle::new();
        (
            WatchSender {
                tx,
                handle: handle.clone(),
            },
            Watch {
                rx: Some(rx),
                handle,
            },
        )
    }

    /// Next sample or error. Returns `None` when the stream ended or was
    /// stopped; no event is yielded after `stop`, even one already buffered.
    pub async fn next_event(&mut self) -> Option<PositionEvent> {
        if !self.handle.is_active() {
            self.rx = None;
            return None;
        }
        let rx = self.rx.as_mut()?;

        let event = tokio::select! {
            event = rx.recv() => event,
            _ = self.handle.stopped() => None,
        };

        if event.is_none() || !self.handle.is_active() {
            self.rx = None;
            return None;
        }
        event
    }

    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some() && self.handle.is_active()
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        self.handle.stop();
        self.rx = None;
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

/// Platform capability to sample the current location.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Acquire a single fix.
    async fn get_once(&self, options: &PositionOptions) -> Result<Position, PositionErrorKind>;

    /// Begin continuous sampling. Transient failures are delivered as
    /// `PositionEvent::Error` and do not end the stream.
    fn watch(&self, options: &PositionOptions) -> Watch;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_events_flow_until_stop() {
        let (tx, mut watch) = Watch::channel(8);
        let p = Position::new(1.0, 2.0, Utc::now());

        assert!(tx.send(PositionEvent::Sample(p)).await);
        assert!(tx.send(PositionEvent::Error(PositionErrorKind::Timeout)).await);

        assert_eq!(watch.next_event().await, Some(PositionEvent::Sample(p)));

        watch.stop();
        // Buffered error is discarded after stop.
        assert_eq!(watch.next_event().await, None);
        assert!(!tx.send(PositionEvent::Sample(p)).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_tx, mut watch) = Watch::channel(1);
        let handle = watch.handle();
        assert!(handle.stop());
        assert!(!handle.stop());
        watch.stop();
        assert!(!watch.is_active());
    }

    #[tokio::test]
    async fn test_stop_from_handle_wakes_pending_consumer() {
        let (_tx, mut watch) = Watch::channel(1);
        let handle = watch.handle();
        let waiter = tokio::spawn(async move { watch.next_event().await });
        tokio::task::yield_now().await;
        handle.stop();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
