//! Strikewatch - live lightning strike ingestion and proximity queries
//!
//! Subscribes to a public strike-detection feed tile by tile, keeps a
//! rolling buffer of recent strikes and answers "how close is the lightning"
//! queries with a safety classification.

pub mod buffer;
pub mod config;
pub mod feed;
pub mod geo;
pub mod geohash;
pub mod ingest;
pub mod query;
pub mod strike;
pub mod subscriptions;
pub mod tiles;

pub use config::{load_config, load_config_or_default, StrikeConfig};
pub use feed::{FeedError, MqttFeed, StrikeFeed};
pub use ingest::{ConnectionState, IngestError, ServiceStatus, StrikeService};
pub use query::{
    LightningActivity, LightningQuery, QueryEngine, QueryError, SafetyAssessment, SafetyLevel,
    StrikeSource, StrikeStatistics,
};
pub use strike::{NearbyStrike, StrikeEvent};
pub use tiles::{Tile, TileIndexer};
