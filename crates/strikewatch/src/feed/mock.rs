//! In-process feed for tests.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{FeedError, FeedEvent, Result, StrikeFeed};

#[derive(Default)]
struct MockState {
    events: Option<mpsc::Sender<FeedEvent>>,
    subscribed: BTreeSet<String>,
    subscribe_calls: Vec<String>,
    unsubscribe_calls: Vec<String>,
    connects: usize,
    disconnects: usize,
    failures_left: usize,
}

/// Records every call and lets tests publish messages or drop the session.
#[derive(Default)]
pub struct MockFeed {
    state: Mutex<MockState>,
    connect_delay: Duration,
    subscribe_delay: Duration,
}

impl MockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `connect` take `delay` before succeeding.
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::default()
        }
    }

    /// Make every `subscribe` yield for `delay` before taking effect.
    pub fn with_subscribe_delay(delay: Duration) -> Self {
        Self {
            subscribe_delay: delay,
            ..Self::default()
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.state().failures_left = count;
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }

    /// Topics subscribed on the current session.
    pub fn subscribed(&self) -> BTreeSet<String> {
        self.state().subscribed.clone()
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        self.state().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.state().unsubscribe_calls.clone()
    }

    /// Deliver a message as if the broker published it. Returns false when
    /// no session is open.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        let sender = self.state().events.clone();
        match sender {
            Some(tx) => tx
                .send(FeedEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the broker dropping the session.
    pub async fn drop_connection(&self, reason: &str) {
        let sender = {
            let mut state = self.state();
            state.subscribed.clear();
            state.events.take()
        };
        if let Some(tx) = sender {
            let _ = tx
                .send(FeedEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl StrikeFeed for MockFeed {
    async fn connect(&self, events: mpsc::Sender<FeedEvent>) -> Result<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let mut state = self.state();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(FeedError::Connect("mock: connection refused".to_string()));
        }
        state.connects += 1;
        state.subscribed.clear();
        state.events = Some(events);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.subscribe_delay.is_zero() {
            tokio::time::sleep(self.subscribe_delay).await;
        }

        let mut state = self.state();
        if state.events.is_none() {
            return Err(FeedError::NotConnected);
        }
        state.subscribe_calls.push(topic.to_string());
        state.subscribed.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.state();
        state.unsubscribe_calls.push(topic.to_string());
        state.subscribed.remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        state.disconnects += 1;
        state.subscribed.clear();
        state.events = None;
        Ok(())
    }
}
