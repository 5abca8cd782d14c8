//! Strike ingestion service
//!
//! Owns the feed connection, the subscription set and the rolling strike
//! buffer. Three activities touch the shared state: inbound message
//! dispatch, query-driven subscription changes, and the two maintenance
//! timers (buffer cleanup, subscription pruning). Every critical section is
//! a short synchronous `std::sync::Mutex` hold, never held across `.await`.
//! Subscription changes and the broker requests that mirror them run under
//! one async lock, so the broker never holds a tile the set has dropped.
//!
//! # Connection lifecycle
//!
//! `Disconnected -> Connecting -> Connected`, and back to `Disconnected` when
//! the feed reports the session closed. Concurrent [`StrikeService::ensure_connected`]
//! callers share one in-flight attempt. A lost or failed connection is retried
//! after the configured reconnect period, and surviving subscriptions are
//! restored on the new session.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::buffer::{InsertOutcome, StrikeBuffer};
use crate::config::StrikeConfig;
use crate::feed::{FeedError, FeedEvent, StrikeFeed, INBOUND_CAPACITY};
use crate::geo::haversine_km;
use crate::strike::{parse_strike, NearbyStrike};
use crate::subscriptions::{SubscriptionChange, SubscriptionSet};
use crate::tiles::{tile_topic, Tile, TileIndexer};

/// Malformed messages between two warn-level log lines.
const REJECT_LOG_EVERY: u64 = 100;

#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,

    #[error("Connect task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<()>>>;

enum Connection {
    Disconnected,
    Connecting(ConnectFuture),
    Connected,
}

impl Connection {
    fn state(&self) -> ConnectionState {
        match self {
            Connection::Disconnected => ConnectionState::Disconnected,
            Connection::Connecting(_) => ConnectionState::Connecting,
            Connection::Connected => ConnectionState::Connected,
        }
    }
}

/// Diagnostic snapshot of the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub state: ConnectionState,
    pub buffered_strikes: usize,
    pub subscriptions: usize,
    pub tiles: Vec<Tile>,
    pub rejected_messages: u64,
}

#[derive(Default)]
struct Tasks {
    shutdown: Option<watch::Sender<()>>,
    maintenance: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn stop_all(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        for handle in self.maintenance.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.dispatcher.take() {
            handle.abort();
        }
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct Inner<F> {
    config: StrikeConfig,
    indexer: TileIndexer,
    feed: F,
    connection: Mutex<Connection>,
    /// Bumped by every disconnect; attempts from an older generation are void.
    generation: AtomicU64,
    buffer: Mutex<StrikeBuffer>,
    subscriptions: Mutex<SubscriptionSet>,
    tasks: Mutex<Tasks>,
    /// Serializes subscription-set changes with their broker requests.
    subscribing: tokio::sync::Mutex<()>,
    rejected: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Live lightning strike ingestion with on-demand spatial queries.
pub struct StrikeService<F: StrikeFeed> {
    inner: Arc<Inner<F>>,
}

impl<F: StrikeFeed> Clone for StrikeService<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: StrikeFeed> StrikeService<F> {
    pub fn new(config: StrikeConfig, feed: F) -> Self {
        let indexer = TileIndexer::new(config.max_tile_expansion, config.default_precision);
        let buffer = StrikeBuffer::new(config.max_buffer_size);
        let subscriptions = SubscriptionSet::new(config.max_subscriptions);

        Self {
            inner: Arc::new(Inner {
                config,
                indexer,
                feed,
                connection: Mutex::new(Connection::Disconnected),
                generation: AtomicU64::new(0),
                buffer: Mutex::new(buffer),
                subscriptions: Mutex::new(subscriptions),
                tasks: Mutex::new(Tasks::default()),
                subscribing: tokio::sync::Mutex::new(()),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &StrikeConfig {
        &self.inner.config
    }

    pub fn feed(&self) -> &F {
        &self.inner.feed
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.connection).state()
    }

    pub fn buffer_len(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Access time of a subscribed tile, if subscribed.
    pub fn subscription_last_access(&self, tile: &str) -> Option<i64> {
        lock(&self.inner.subscriptions)
            .get(tile)
            .map(|e| e.last_access_ms)
    }

    pub fn status(&self) -> ServiceStatus {
        let state = self.connection_state();
        let buffered_strikes = self.buffer_len();
        let (subscriptions, tiles) = {
            let subs = lock(&self.inner.subscriptions);
            (subs.len(), subs.tiles())
        };
        ServiceStatus {
            state,
            buffered_strikes,
            subscriptions,
            tiles,
            rejected_messages: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Start the maintenance timers and open the feed connection.
    pub async fn init(&self) -> Result<()> {
        self.inner.start_maintenance();
        self.ensure_connected().await
    }

    /// Connect if needed. Concurrent callers await the same attempt.
    pub async fn ensure_connected(&self) -> Result<()> {
        Inner::ensure_connected(&self.inner).await
    }

    /// Make sure the tiles covering a circle are subscribed.
    ///
    /// New tiles that would overflow the subscription budget first evict the
    /// least recently used subscriptions. Every covering tile, new or not,
    /// has its access time refreshed.
    pub async fn subscribe_to_location(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<SubscriptionChange> {
        self.ensure_connected().await?;
        Ok(self.inner.cover_location(lat, lon, radius_km, now_ms()).await)
    }

    /// Handle one inbound message. Returns true if a new strike was stored.
    ///
    /// Never fails: malformed payloads are logged and dropped.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        self.inner.handle_message(topic, payload)
    }

    /// Strikes within `radius_km` in the last `window_minutes`, nearest first.
    ///
    /// Subscribes to the area if needed, then waits the settle interval so
    /// in-flight messages can land before the buffer is read. The dwell is
    /// a heuristic: it does not confirm that any particular message arrived.
    /// Ingestion failures yield an empty list. The work runs on its own task,
    /// so dropping the returned future does not interrupt it.
    pub async fn get_strikes(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        window_minutes: u32,
    ) -> Vec<NearbyStrike> {
        let service = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = service.subscribe_to_location(lat, lon, radius_km).await {
                log::warn!("Lightning data unavailable: {}", e);
                return Vec::new();
            }

            let settle = service.inner.config.settle_interval();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }

            service.strikes_near(lat, lon, radius_km, window_minutes, now_ms())
        });

        match task.await {
            Ok(strikes) => strikes,
            Err(e) => {
                log::error!("Strike query task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Filter the buffer without touching subscriptions or waiting.
    pub fn strikes_near(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        window_minutes: u32,
        now_ms: i64,
    ) -> Vec<NearbyStrike> {
        let cutoff = now_ms - i64::from(window_minutes) * 60_000;

        let mut strikes: Vec<NearbyStrike> = lock(&self.inner.buffer)
            .iter()
            .filter(|s| s.time_ms() >= cutoff)
            .filter_map(|s| {
                let distance_km = haversine_km(lat, lon, s.latitude, s.longitude);
                (distance_km <= radius_km).then(|| NearbyStrike {
                    strike: s.clone(),
                    distance_km,
                })
            })
            .collect();

        strikes.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        strikes
    }

    /// Drop strikes older than the retention period, relative to `now_ms`.
    pub fn cleanup_expired(&self, now_ms: i64) -> usize {
        self.inner.cleanup_expired(now_ms)
    }

    /// Unsubscribe tiles idle for longer than the staleness threshold.
    pub async fn prune_stale_subscriptions(&self, now_ms: i64) -> Vec<Tile> {
        self.inner.prune_stale_subscriptions(now_ms).await
    }

    /// Stop timers, close the connection and forget all subscriptions.
    ///
    /// Safe in any connection state. An attempt still in flight is torn
    /// down when it completes. Buffered strikes are kept.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);

        let previous = std::mem::replace(&mut *lock(&inner.connection), Connection::Disconnected);
        lock(&inner.tasks).stop_all();
        let cleared = lock(&inner.subscriptions).clear();

        if matches!(previous, Connection::Connected) {
            if let Err(e) = inner.feed.disconnect().await {
                log::warn!("Feed disconnect failed: {}", e);
            }
        }

        log::info!(
            "Strike service disconnected ({} subscriptions cleared, was {:?})",
            cleared.len(),
            previous.state()
        );
    }

    /// Disconnect and discard buffered strikes.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        lock(&self.inner.buffer).clear();
    }
}

impl<F: StrikeFeed> Inner<F> {
    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let attempt = {
            let mut connection = lock(&self.connection);
            match &*connection {
                Connection::Connected => return Ok(()),
                Connection::Connecting(attempt) => attempt.clone(),
                Connection::Disconnected => {
                    let generation = self.generation.load(Ordering::SeqCst);
                    let task = tokio::spawn(Self::establish(self.clone(), generation));
                    let attempt = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(IngestError::Join(e.to_string())),
                        }
                    }
                    .boxed()
                    .shared();
                    *connection = Connection::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// One connection attempt. Runs on its own task so that it completes even
    /// if every waiting caller goes away.
    fn establish(self: Arc<Self>, generation: u64) -> BoxFuture<'static, Result<()>> {
        async move {
            log::info!("Connecting to strike feed at {}", self.config.broker_url);

            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            let timeout = self.config.connect_timeout();
            let result = match tokio::time::timeout(timeout, self.feed.connect(tx)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Timeout(timeout)),
            };

            let mut rx = Some(rx);
            let superseded = {
                let mut connection = lock(&self.connection);
                if self.generation.load(Ordering::SeqCst) != generation {
                    true
                } else {
                    match result {
                        Ok(()) => {
                            *connection = Connection::Connected;
                            // Started under the connection lock: a racing
                            // disconnect() stops them after this block.
                            if let Some(rx) = rx.take() {
                                self.spawn_dispatcher(rx, generation);
                            }
                            self.start_maintenance();
                        }
                        Err(_) => *connection = Connection::Disconnected,
                    }
                    false
                }
            };

            if superseded {
                if result.is_ok() {
                    let _ = self.feed.disconnect().await;
                }
                log::debug!("Discarding connection attempt superseded by disconnect");
                return Err(IngestError::Cancelled);
            }

            match result {
                Ok(()) => {
                    log::info!("Strike feed connected");
                    self.resubscribe_all(generation).await;
                    Ok(())
                }
                Err(e) => {
                    log::warn!(
                        "Strike feed connection failed: {} (retrying in {:?})",
                        e,
                        self.config.reconnect_period()
                    );
                    self.schedule_reconnect(generation);
                    Err(e.into())
                }
            }
        }
        .boxed()
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::Receiver<FeedEvent>, generation: u64) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let reason = loop {
                let Some(event) = rx.recv().await else {
                    break "event channel closed".to_string();
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    FeedEvent::Message { topic, payload } => {
                        inner.handle_message(&topic, &payload);
                    }
                    FeedEvent::Closed { reason } => break reason,
                }
            };

            if let Some(inner) = weak.upgrade() {
                inner.on_connection_lost(generation, &reason);
            }
        });

        if let Some(old) = lock(&self.tasks).dispatcher.replace(handle) {
            old.abort();
        }
    }

    fn on_connection_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut connection = lock(&self.connection);
            if self.generation.load(Ordering::SeqCst) != generation
                || !matches!(*connection, Connection::Connected)
            {
                return;
            }
            *connection = Connection::Disconnected;
        }

        log::warn!(
            "Strike feed connection lost: {} (reconnecting in {:?})",
            reason,
            self.config.reconnect_period()
        );
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let weak = Arc::downgrade(self);
        let period = self.config.reconnect_period();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = Inner::ensure_connected(&inner).await {
                log::debug!("Reconnect attempt failed: {}", e);
            }
        });

        if let Some(old) = lock(&self.tasks).reconnect.replace(handle) {
            old.abort();
        }
    }

    /// Restore every subscription after a fresh session.
    async fn resubscribe_all(&self, generation: u64) {
        let _guard = self.subscribing.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let tiles = lock(&self.subscriptions).tiles();
        if tiles.is_empty() {
            return;
        }

        log::info!("Restoring {} tile subscriptions", tiles.len());
        for tile in tiles {
            let topic = tile_topic(&self.config.topic_prefix, &tile);
            if let Err(e) = self.feed.subscribe(&topic).await {
                log::warn!("Resubscribe failed, dropping tile {}: {}", tile, e);
                lock(&self.subscriptions).remove(&tile);
            }
        }
    }

    async fn cover_location(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        now_ms: i64,
    ) -> SubscriptionChange {
        let required = self.indexer.select_subscription_tiles(
            lat,
            lon,
            radius_km,
            self.config.max_subscriptions,
        );

        let _guard = self.subscribing.lock().await;
        let mut change = lock(&self.subscriptions).cover(&required, now_ms);

        for tile in &change.evicted {
            let topic = tile_topic(&self.config.topic_prefix, tile);
            match self.feed.unsubscribe(&topic).await {
                Ok(()) => log::debug!("Evicted subscription {}", topic),
                Err(e) => log::warn!("Unsubscribe failed for {}: {}", topic, e),
            }
        }

        let mut subscribed = Vec::with_capacity(change.added.len());
        for tile in change.added.drain(..) {
            let topic = tile_topic(&self.config.topic_prefix, &tile);
            match self.feed.subscribe(&topic).await {
                Ok(()) => {
                    log::debug!("Subscribed to {}", topic);
                    subscribed.push(tile);
                }
                Err(e) => {
                    log::warn!("Subscribe failed for {}: {}", topic, e);
                    lock(&self.subscriptions).remove(&tile);
                }
            }
        }
        change.added = subscribed;

        if !change.is_empty() {
            log::info!(
                "Coverage for ({:.4}, {:.4}) r={} km: +{} -{} ({} active)",
                lat,
                lon,
                radius_km,
                change.added.len(),
                change.evicted.len(),
                lock(&self.subscriptions).len()
            );
        }

        change
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        match parse_strike(payload) {
            Ok(strike) => match lock(&self.buffer).insert(strike) {
                InsertOutcome::Inserted { evicted } => {
                    if evicted > 0 {
                        log::debug!("Strike buffer full, evicted {} oldest strikes", evicted);
                    }
                    true
                }
                InsertOutcome::Duplicate => false,
            },
            Err(e) => {
                let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("Dropping malformed strike message on {}: {}", topic, e);
                if rejected % REJECT_LOG_EVERY == 0 {
                    log::warn!("{} malformed strike messages dropped so far", rejected);
                }
                false
            }
        }
    }

    fn cleanup_expired(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - duration_ms(self.config.retention());
        let removed = lock(&self.buffer).remove_older_than(cutoff);
        if removed > 0 {
            log::debug!("Removed {} expired strikes", removed);
        }
        removed
    }

    async fn prune_stale_subscriptions(&self, now_ms: i64) -> Vec<Tile> {
        let cutoff = now_ms - duration_ms(self.config.subscription_staleness());
        let _guard = self.subscribing.lock().await;
        let stale = lock(&self.subscriptions).prune_stale(cutoff);

        for tile in &stale {
            let topic = tile_topic(&self.config.topic_prefix, tile);
            if let Err(e) = self.feed.unsubscribe(&topic).await {
                log::warn!("Unsubscribe failed for stale tile {}: {}", topic, e);
            }
        }
        if !stale.is_empty() {
            log::debug!("Pruned {} stale subscriptions", stale.len());
        }
        stale
    }

    /// Spawn the cleanup and pruning timers unless they are already running.
    ///
    /// Each timer runs its job inline on a single task, so a slow run delays
    /// the next tick instead of overlapping it; missed ticks are skipped.
    fn start_maintenance(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if tasks.shutdown.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let cleanup = {
            let weak = Arc::downgrade(self);
            let mut shutdown = shutdown_rx.clone();
            let period = self.config.cleanup_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = weak.upgrade() else { break };
                            inner.cleanup_expired(now_ms());
                        }
                    }
                }
            })
        };

        let prune = {
            let weak = Arc::downgrade(self);
            let mut shutdown = shutdown_rx;
            let period = self.config.prune_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let Some(inner) = weak.upgrade() else { break };
                            inner.prune_stale_subscriptions(now_ms()).await;
                        }
                    }
                }
            })
        };

        tasks.shutdown = Some(shutdown_tx);
        tasks.maintenance = vec![cleanup, prune];
        log::debug!("Started strike maintenance timers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::mock::MockFeed;
    use std::collections::BTreeSet;

    const NYC: (f64, f64) = (40.7128, -74.0060);

    fn test_config() -> StrikeConfig {
        StrikeConfig {
            settle_ms: 0,
            reconnect_period_ms: 20,
            connect_timeout_ms: 1_000,
            ..StrikeConfig::default()
        }
    }

    fn payload(time_ms: i64, lat: f64, lon: f64, mcs: f64) -> Vec<u8> {
        format!(
            r#"{{"time":{},"lat":{},"lon":{},"pol":1,"mcs":{}}}"#,
            time_ms * 1_000_000,
            lat,
            lon,
            mcs
        )
        .into_bytes()
    }

    async fn wait_for<P: Fn() -> bool>(predicate: P) -> bool {
        for _ in 0..200 {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        predicate()
    }

    #[tokio::test]
    async fn ensure_connected_is_idempotent() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);

        service.ensure_connected().await.unwrap();
        service.ensure_connected().await.unwrap();

        assert_eq!(service.connection_state(), ConnectionState::Connected);
        assert_eq!(service.feed().connect_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let feed = MockFeed::with_connect_delay(Duration::from_millis(50));
        let service = StrikeService::new(test_config(), feed);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let s = service.clone();
                tokio::spawn(async move { s.ensure_connected().await })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap().unwrap();
        }

        assert_eq!(service.feed().connect_count(), 1);
        assert_eq!(service.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn failed_connect_is_retried_after_backoff() {
        let feed = MockFeed::new();
        feed.fail_next_connects(1);
        let service = StrikeService::new(test_config(), feed);

        assert!(matches!(
            service.ensure_connected().await,
            Err(IngestError::Feed(FeedError::Connect(_)))
        ));
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);

        let s = service.clone();
        assert!(wait_for(|| s.connection_state() == ConnectionState::Connected).await);
        assert_eq!(service.feed().connect_count(), 1);
    }

    #[tokio::test]
    async fn subscribe_twice_only_refreshes() {
        let service = StrikeService::new(test_config(), MockFeed::new());

        let first = service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();
        assert!(!first.added.is_empty());
        let count = service.subscription_count();
        let tile = first.added[0].clone();
        let before = service.subscription_last_access(&tile).unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();

        assert!(second.added.is_empty());
        assert!(second.evicted.is_empty());
        assert_eq!(service.subscription_count(), count);
        assert!(service.subscription_last_access(&tile).unwrap() > before);
        assert_eq!(service.feed().subscribe_calls().len(), count);
    }

    #[tokio::test]
    async fn subscriptions_use_one_topic_segment_per_character() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();

        let expected: Vec<String> = TileIndexer::default()
            .select_subscription_tiles(NYC.0, NYC.1, 100.0, 9)
            .iter()
            .map(|t| tile_topic("blitzortung/1.1", t))
            .collect();
        let subscribed: Vec<String> = service.feed().subscribed().into_iter().collect();
        assert_eq!(subscribed, expected);
        assert!(subscribed.iter().all(|t| t.starts_with("blitzortung/1.1/d/r/")));
    }

    #[tokio::test]
    async fn budget_overflow_unsubscribes_oldest() {
        let config = StrikeConfig {
            max_subscriptions: 2,
            ..test_config()
        };
        let service = StrikeService::new(config, MockFeed::new());

        service.subscribe_to_location(NYC.0, NYC.1, 100.0).await.unwrap();
        // Sydney needs fresh tiles, so the New York ones must go
        let change = service
            .subscribe_to_location(-33.8688, 151.2093, 50.0)
            .await
            .unwrap();

        let expected: BTreeSet<String> = TileIndexer::default()
            .select_subscription_tiles(-33.8688, 151.2093, 50.0, 2)
            .iter()
            .map(|t| tile_topic("blitzortung/1.1", t))
            .collect();

        assert!(!change.evicted.is_empty());
        assert!(service.subscription_count() <= 2);
        assert_eq!(
            service.feed().unsubscribe_calls().len(),
            change.evicted.len()
        );
        assert_eq!(service.feed().subscribed(), expected);
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_buffer() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        service.ensure_connected().await.unwrap();

        let now = now_ms();
        assert!(
            service
                .feed()
                .publish("blitzortung/1.1/d/r/5", &payload(now, 40.8, -74.0, 30.0))
                .await
        );
        assert!(service.feed().publish("blitzortung/1.1/d/r/5", b"{broken").await);

        let s = service.clone();
        assert!(wait_for(|| s.buffer_len() == 1).await);
        assert!(wait_for(|| s.status().rejected_messages == 1).await);
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        assert!(!service.handle_message("t", br#"{"lat":1.0,"lon":2.0}"#));
        assert!(!service.handle_message("t", b"\xff\xfe"));

        let valid = payload(now_ms(), 1.0, 2.0, 0.0);
        assert!(service.handle_message("t", &valid));
        // Retransmission is a duplicate, not a rejection
        assert!(!service.handle_message("t", &valid));
        assert_eq!(service.buffer_len(), 1);
        assert_eq!(service.status().rejected_messages, 2);
    }

    #[tokio::test]
    async fn full_buffer_keeps_newest_strike() {
        let config = StrikeConfig {
            max_buffer_size: 50,
            ..test_config()
        };
        let service = StrikeService::new(config, MockFeed::new());
        let now = now_ms();
        for i in 0..50 {
            service.handle_message("t", &payload(now - 1_000 - i, 40.0, -74.0, 0.0));
        }
        assert_eq!(service.buffer_len(), 50);

        assert!(service.handle_message("t", &payload(now, 40.5, -74.5, 0.0)));
        assert!(service.buffer_len() <= 50);
        let found = service.strikes_near(40.5, -74.5, 1.0, 5, now);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn get_strikes_filters_and_sorts() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        let now = now_ms();

        service.handle_message("t", &payload(now - 60_000, 40.90, -74.0060, 10.0)); // ~21 km
        service.handle_message("t", &payload(now - 30_000, 40.75, -74.0060, 10.0)); // ~4 km
        service.handle_message("t", &payload(now - 90 * 60_000, 40.72, -74.0060, 10.0)); // too old
        service.handle_message("t", &payload(now - 10_000, 42.50, -74.0060, 10.0)); // ~199 km

        let strikes = service.get_strikes(NYC.0, NYC.1, 50.0, 60).await;
        assert_eq!(strikes.len(), 2);
        assert!(strikes[0].distance_km < strikes[1].distance_km);

        let expected = haversine_km(NYC.0, NYC.1, 40.75, -74.0060);
        assert!((strikes[0].distance_km - expected).abs() < 1e-9);
        assert!(service.subscription_count() > 0);
    }

    #[tokio::test]
    async fn get_strikes_degrades_to_empty_when_feed_is_down() {
        let feed = MockFeed::new();
        feed.fail_next_connects(1_000);
        let service = StrikeService::new(test_config(), feed);
        service.handle_message("t", &payload(now_ms(), NYC.0, NYC.1, 10.0));

        let strikes = service.get_strikes(NYC.0, NYC.1, 50.0, 60).await;
        assert!(strikes.is_empty());
        service.disconnect().await;
    }

    #[tokio::test]
    async fn cleanup_drops_strikes_past_retention() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        let now = now_ms();
        service.handle_message("t", &payload(now - 3 * 3_600_000, 1.0, 1.0, 0.0));
        service.handle_message("t", &payload(now - 60_000, 1.0, 1.0, 0.0));

        assert_eq!(service.cleanup_expired(now), 1);
        assert_eq!(service.buffer_len(), 1);
    }

    #[tokio::test]
    async fn pruning_unsubscribes_idle_tiles() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        let change = service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();

        let now = now_ms();
        assert!(service.prune_stale_subscriptions(now).await.is_empty());

        let later = now + 61 * 60_000;
        let pruned = service.prune_stale_subscriptions(later).await;
        assert_eq!(pruned.len(), change.added.len());
        assert_eq!(service.subscription_count(), 0);
        assert!(service.feed().subscribed().is_empty());
    }

    #[tokio::test]
    async fn reconnect_restores_subscriptions() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();
        let topics = service.feed().subscribed();
        assert!(!topics.is_empty());

        service.feed().drop_connection("broker restart").await;
        let s = service.clone();
        assert!(wait_for(|| s.feed().connect_count() == 2 && s.feed().subscribed() == topics).await);
        assert_eq!(service.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_clears_state_in_any_state() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        service.disconnect().await;

        service.init().await.unwrap();
        service
            .subscribe_to_location(NYC.0, NYC.1, 100.0)
            .await
            .unwrap();
        service.handle_message("t", &payload(now_ms(), 1.0, 1.0, 0.0));

        service.disconnect().await;
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
        assert_eq!(service.subscription_count(), 0);
        assert_eq!(service.buffer_len(), 1);
        assert_eq!(service.feed().disconnect_count(), 1);
        assert!(!service.feed().is_connected());
    }

    #[tokio::test]
    async fn disconnect_during_connect_voids_attempt() {
        let feed = MockFeed::with_connect_delay(Duration::from_millis(50));
        let service = StrikeService::new(test_config(), feed);

        let s = service.clone();
        let attempt = tokio::spawn(async move { s.ensure_connected().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(service.connection_state(), ConnectionState::Connecting);

        service.disconnect().await;
        assert!(matches!(attempt.await.unwrap(), Err(IngestError::Cancelled)));
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
        assert!(!service.feed().is_connected());
    }

    #[tokio::test]
    async fn overlapping_coverage_changes_keep_broker_in_sync() {
        let config = StrikeConfig {
            max_subscriptions: 2,
            ..test_config()
        };
        let feed = MockFeed::with_subscribe_delay(Duration::from_millis(10));
        let service = StrikeService::new(config, feed);
        service.ensure_connected().await.unwrap();

        let s = service.clone();
        let new_york =
            tokio::spawn(async move { s.subscribe_to_location(NYC.0, NYC.1, 100.0).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let s = service.clone();
        let sydney =
            tokio::spawn(async move { s.subscribe_to_location(-33.8688, 151.2093, 50.0).await });
        new_york.await.unwrap().unwrap();
        sydney.await.unwrap().unwrap();

        let tracked: BTreeSet<String> = service
            .status()
            .tiles
            .iter()
            .map(|t| tile_topic("blitzortung/1.1", t))
            .collect();
        assert!(tracked.len() <= 2);
        assert_eq!(service.feed().subscribed(), tracked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disconnect_racing_connect_leaves_no_tasks() {
        for _ in 0..50 {
            let service = StrikeService::new(test_config(), MockFeed::new());
            let s = service.clone();
            let attempt = tokio::spawn(async move { s.ensure_connected().await });
            tokio::task::yield_now().await;
            service.disconnect().await;
            let _ = attempt.await.unwrap();

            if service.connection_state() == ConnectionState::Disconnected {
                let tasks = lock(&service.inner.tasks);
                assert!(tasks.shutdown.is_none());
                assert!(tasks.maintenance.is_empty());
                assert!(tasks.dispatcher.is_none());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_timers_run_until_disconnect() {
        let service = StrikeService::new(test_config(), MockFeed::new());
        service.init().await.unwrap();

        let long_ago = now_ms() - 3 * 3_600_000;
        service
            .inner
            .cover_location(NYC.0, NYC.1, 100.0, long_ago)
            .await;
        assert!(service.subscription_count() > 0);
        service.handle_message("t", &payload(long_ago, 1.0, 1.0, 0.0));
        service.handle_message("t", &payload(now_ms(), 2.0, 2.0, 0.0));
        assert_eq!(service.buffer_len(), 2);

        // Cleanup every 60 s, pruning every 300 s
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(service.buffer_len(), 1);
        assert!(service.subscription_count() > 0);

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(service.subscription_count(), 0);
        assert!(service.feed().subscribed().is_empty());

        service.disconnect().await;
        service.handle_message("t", &payload(long_ago - 1, 3.0, 3.0, 0.0));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(service.buffer_len(), 2);
    }
}
