// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Geolocation provider boundary.
//!
//! Positions come from the member's device. A [`LocationProvider`] offers a
//! one-shot position and a continuous watch; dropping the [`LocationWatch`]
//! is the cancellation.

use crate::models::Coordinates;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Platform geolocation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable")]
    PositionUnavailable,

    #[error("timed out waiting for a position")]
    Timeout,

    #[error("geolocation not supported")]
    Unsupported,
}

/// One reading from the device: a position or the platform's error.
pub type LocationSample = Result<Coordinates, LocationError>;

/// A source of device positions.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// A single position. Callers bound the wait themselves.
    async fn current_position(&self) -> LocationSample;

    /// Continuous positions until the returned watch is dropped.
    fn watch_position(&self) -> LocationWatch;
}

/// Stream of samples from a watch; dropping it cancels the watch.
pub struct LocationWatch {
    samples: BoxStream<'static, LocationSample>,
}

impl LocationWatch {
    pub fn new(samples: BoxStream<'static, LocationSample>) -> Self {
        Self { samples }
    }

    /// Next sample, or `None` once the provider has stopped.
    pub async fn next(&mut self) -> Option<LocationSample> {
        self.samples.next().await
    }
}

/// Provider fed by samples the device reports over HTTP.
///
/// Every open watch receives each pushed sample. A one-shot request waits
/// for the next push.
#[derive(Clone)]
pub struct DeviceLocationFeed {
    sender: broadcast::Sender<LocationSample>,
}

impl Default for DeviceLocationFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLocationFeed {
    const CAPACITY: usize = 16;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    /// Deliver a sample to every open watch. Returns how many received it.
    pub fn push(&self, sample: LocationSample) -> usize {
        self.sender.send(sample).unwrap_or(0)
    }

    /// Watches (and pending one-shot requests) currently listening.
    pub fn watcher_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn samples(&self) -> BoxStream<'static, LocationSample> {
        let rx = self.sender.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(sample) => return Some((sample, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Location watch lagged, skipping samples");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl LocationProvider for DeviceLocationFeed {
    async fn current_position(&self) -> LocationSample {
        self.samples()
            .next()
            .await
            .unwrap_or(Err(LocationError::PositionUnavailable))
    }

    fn watch_position(&self) -> LocationWatch {
        LocationWatch::new(self.samples())
    }
}

/// A single sample the device already acquired (manual check-in).
#[derive(Debug, Clone)]
pub struct ReportedPosition(pub LocationSample);

#[async_trait]
impl LocationProvider for ReportedPosition {
    async fn current_position(&self) -> LocationSample {
        self.0.clone()
    }

    fn watch_position(&self) -> LocationWatch {
        LocationWatch::new(stream::once(std::future::ready(self.0.clone())).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_device_feed_fans_out_to_watches() {
        let feed = DeviceLocationFeed::new();
        let mut a = feed.watch_position();
        let mut b = feed.watch_position();
        assert_eq!(feed.watcher_count(), 2);

        let here = Coordinates::new(51.5, -0.1);
        assert_eq!(feed.push(Ok(here)), 2);
        assert_eq!(a.next().await, Some(Ok(here)));
        assert_eq!(b.next().await, Some(Ok(here)));

        drop(a);
        assert_eq!(feed.watcher_count(), 1);
        assert_eq!(feed.push(Err(LocationError::Timeout)), 1);
        assert_eq!(b.next().await, Some(Err(LocationError::Timeout)));
    }

    #[tokio::test]
    async fn test_push_without_watchers() {
        let feed = DeviceLocationFeed::new();
        assert_eq!(feed.push(Ok(Coordinates::new(0.0, 0.0))), 0);
    }

    #[tokio::test]
    async fn test_current_position_waits_for_push() {
        let feed = DeviceLocationFeed::new();
        let pusher = feed.clone();
        let here = Coordinates::new(51.5, -0.1);

        let waiter = tokio::spawn(async move { feed.current_position().await });
        // Wait until the one-shot request is listening
        while pusher.watcher_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        pusher.push(Ok(here));
        assert_eq!(waiter.await.unwrap(), Ok(here));
    }

    #[tokio::test]
    async fn test_reported_position() {
        let provider = ReportedPosition(Err(LocationError::PermissionDenied));
        assert_eq!(
            provider.current_position().await,
            Err(LocationError::PermissionDenied)
        );

        let mut watch = ReportedPosition(Ok(Coordinates::new(1.0, 2.0))).watch_position();
        assert_eq!(watch.next().await, Some(Ok(Coordinates::new(1.0, 2.0))));
        assert_eq!(watch.next().await, None);
    }
}
