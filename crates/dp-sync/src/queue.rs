//! Bounded FIFO between the observer and the dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dp_core::FileEvent;
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<FileEvent>,
    depth: Arc<AtomicUsize>,
    gauge: IntGauge,
}

pub struct EventReceiver {
    rx: mpsc::Receiver<FileEvent>,
    depth: Arc<AtomicUsize>,
    gauge: IntGauge,
}

pub fn event_queue(capacity: usize, gauge: IntGauge) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            tx,
            depth: Arc::clone(&depth),
            gauge: gauge.clone(),
        },
        EventReceiver { rx, depth, gauge },
    )
}

impl EventSender {
    fn record_push(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.set(depth as i64);
    }

    /// For the watcher thread, which lives outside the runtime.
    pub fn push_blocking(&self, event: FileEvent) -> bool {
        self.record_push();
        if self.tx.blocking_send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("event queue closed, dropping event");
            return false;
        }
        true
    }

    pub async fn push(&self, event: FileEvent) -> bool {
        self.record_push();
        if self.tx.send(event).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("event queue closed, dropping event");
            return false;
        }
        true
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<FileEvent> {
        let event = self.rx.recv().await?;
        let depth = self
            .depth
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        self.gauge.set(depth as i64);
        Some(event)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dp_core::FileEventKind;
    use std::path::PathBuf;

    fn event(name: &str) -> FileEvent {
        FileEvent {
            kind: FileEventKind::Created,
            rel_path: PathBuf::from(name),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn depth_follows_pushes_and_pops() {
        let gauge = IntGauge::new("test_queue_depth", "test").expect("gauge");
        let (tx, mut rx) = event_queue(8, gauge.clone());
        assert!(tx.push(event("a.raw")).await);
        assert!(tx.push(event("b.raw")).await);
        assert_eq!(gauge.get(), 2);
        let first = rx.recv().await.expect("event");
        assert_eq!(first.rel_path, PathBuf::from("a.raw"));
        assert_eq!(rx.depth(), 1);
        assert_eq!(gauge.get(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_events() {
        let gauge = IntGauge::new("test_closed_depth", "test").expect("gauge");
        let (tx, rx) = event_queue(1, gauge);
        drop(rx);
        assert!(!tx.push(event("a.raw")).await);
        assert_eq!(tx.depth(), 0);
    }
}
