// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Realtime query feeds.
//!
//! A store hands out a [`Feed`] per subscribed query. The feed is backed by a
//! `watch` channel whose sender lives in the store; once every receiver is
//! gone the store stops refreshing that query. [`Feed::on_update`] turns a feed
//! into callback delivery and returns a [`SubscriptionHandle`] that must be
//! cancelled (or dropped) when its owner goes away.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Latest result of a subscribed query.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedState<T> {
    /// No snapshot delivered yet
    Loading,
    Ready(T),
    /// The subscription reported an error; no data is trusted
    Failed(String),
}

impl<T> FeedState<T> {
    pub fn ready(&self) -> Option<&T> {
        match self {
            FeedState::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Sending half kept by a store for one subscribed query.
pub type FeedSender<T> = watch::Sender<FeedState<T>>;

/// Receiving half of a subscribed query.
#[derive(Debug, Clone)]
pub struct Feed<T> {
    rx: watch::Receiver<FeedState<T>>,
}

impl<T> Feed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a feed plus the sender a store pushes snapshots into.
    pub fn channel() -> (FeedSender<T>, Self) {
        let (tx, rx) = watch::channel(FeedState::Loading);
        (tx, Self { rx })
    }

    /// Current state without waiting.
    pub fn current(&self) -> FeedState<T> {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change.
    ///
    /// Returns `None` once the store has dropped the query.
    pub async fn changed(&mut self) -> Option<FeedState<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Deliver the current state and every later change to `handler`.
    ///
    /// Consumes the feed. Delivery stops when the returned handle is
    /// cancelled or dropped; once `cancel` returns the handler is never
    /// invoked again.
    pub fn on_update<F>(self, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(FeedState<T>) + Send + 'static,
    {
        let active = Arc::new(Mutex::new(true));
        let task_active = active.clone();
        let mut rx = self.rx;

        let task = tokio::spawn(async move {
            loop {
                let state = rx.borrow_and_update().clone();
                {
                    let guard = task_active.lock();
                    if !*guard {
                        break;
                    }
                    handler(state);
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });

        SubscriptionHandle {
            active,
            task: Some(task),
        }
    }
}

/// Cancellation token for a callback subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    active: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Stop delivery. Idempotent.
    ///
    /// Must not be called from inside the subscription's own handler.
    pub fn cancel(&mut self) {
        *self.active.lock() = false;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Stop delivery and wait until the underlying feed has been released.
    pub async fn unsubscribe(mut self) {
        *self.active.lock() = false;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<FeedState<u32>>) -> FeedState<u32> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_on_update_delivers_current_then_changes() {
        let (tx, feed) = Feed::<u32>::channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = feed.on_update(move |state| {
            let _ = out_tx.send(state);
        });

        assert_eq!(recv(&mut out_rx).await, FeedState::Loading);
        tx.send_replace(FeedState::Ready(3));
        assert_eq!(recv(&mut out_rx).await, FeedState::Ready(3));
        tx.send_replace(FeedState::Failed("boom".to_string()));
        assert_eq!(
            recv(&mut out_rx).await,
            FeedState::Failed("boom".to_string())
        );

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_no_delivery_after_unsubscribe() {
        let (tx, feed) = Feed::<u32>::channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = feed.on_update(move |state| {
            let _ = out_tx.send(state);
        });
        assert_eq!(recv(&mut out_rx).await, FeedState::Loading);

        handle.unsubscribe().await;
        // Receiver side is released, so the store sees a closed query
        assert!(tx.is_closed());

        let _ = tx.send(FeedState::Ready(7));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            out_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let (tx, feed) = Feed::<u32>::channel();
        let handle = feed.on_update(|_| {});
        assert!(handle.is_active());
        drop(handle);

        // Abort is asynchronous on drop; the receiver goes away shortly after.
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("feed should be released after drop");
    }
}
