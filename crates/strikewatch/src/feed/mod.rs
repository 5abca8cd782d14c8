//! Strike feed transport
//!
//! The ingestion service talks to the strike network only through the
//! [`StrikeFeed`] trait, so the broker client can be swapped for an
//! in-process mock in tests.

pub mod mqtt;

#[cfg(any(test, feature = "test-harness"))]
pub mod mock;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub use mqtt::MqttFeed;

/// Capacity of the inbound event channel between a feed and the service.
pub const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Something delivered by an open feed session.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The session ended; no further events follow on this channel.
    Closed { reason: String },
}

/// A publish/subscribe connection to the strike network.
#[async_trait]
pub trait StrikeFeed: Send + Sync + 'static {
    /// Open a session, resolving once the broker has accepted it.
    ///
    /// Messages for subscribed topics, and finally a [`FeedEvent::Closed`],
    /// are delivered on `events` until the session ends. A new call replaces
    /// any previous session.
    async fn connect(&self, events: mpsc::Sender<FeedEvent>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Close the session. Safe to call when not connected.
    async fn disconnect(&self) -> Result<()>;
}
