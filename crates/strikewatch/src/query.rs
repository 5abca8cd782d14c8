//! Lightning activity queries
//!
//! Validates query parameters, pulls nearby strikes from a [`StrikeSource`]
//! and derives summary statistics plus a distance-based safety level.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::feed::StrikeFeed;
use crate::ingest::StrikeService;
use crate::strike::NearbyStrike;

pub const MIN_RADIUS_KM: f64 = 1.0;
pub const MAX_RADIUS_KM: f64 = 500.0;
pub const MIN_TIME_WINDOW_MINUTES: u32 = 5;
pub const MAX_TIME_WINDOW_MINUTES: u32 = 120;

pub const DEFAULT_RADIUS_KM: f64 = 50.0;
pub const DEFAULT_TIME_WINDOW_MINUTES: u32 = 30;

/// Amplitude magnitude above which a strike counts as cloud-to-ground.
pub const CLOUD_TO_GROUND_AMPLITUDE: f64 = 20.0;

/// Strike rate (per minute) above which a storm is considered active.
pub const ACTIVE_STORM_RATE: f64 = 0.5;

/// A nearest strike younger than this marks an active storm.
pub const ACTIVE_STORM_RECENCY_MINUTES: i64 = 10;

pub const DATA_SOURCE: &str = "Blitzortung.org";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Latitude must be between -90 and 90, got {0}")]
    InvalidLatitude(f64),

    #[error("Longitude must be between -180 and 180, got {0}")]
    InvalidLongitude(f64),

    #[error("Radius must be between 1 and 500 km, got {0}")]
    InvalidRadius(f64),

    #[error("Time window must be between 5 and 120 minutes, got {0}")]
    InvalidTimeWindow(u32),
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Where strikes come from. Implementations never fail: an unavailable
/// feed yields an empty list.
#[async_trait]
pub trait StrikeSource: Send + Sync {
    /// Strikes within `radius_km` in the last `window_minutes`, nearest first.
    async fn fetch_strikes(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        window_minutes: u32,
    ) -> Vec<NearbyStrike>;
}

#[async_trait]
impl<F: StrikeFeed> StrikeSource for StrikeService<F> {
    async fn fetch_strikes(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        window_minutes: u32,
    ) -> Vec<NearbyStrike> {
        self.get_strikes(lat, lon, radius_km, window_minutes).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightningQuery {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_radius")]
    pub radius_km: f64,
    #[serde(default = "default_time_window")]
    pub time_window_minutes: u32,
}

fn default_radius() -> f64 {
    DEFAULT_RADIUS_KM
}

fn default_time_window() -> u32 {
    DEFAULT_TIME_WINDOW_MINUTES
}

impl LightningQuery {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            radius_km: DEFAULT_RADIUS_KM,
            time_window_minutes: DEFAULT_TIME_WINDOW_MINUTES,
        }
    }

    pub fn with_radius(mut self, radius_km: f64) -> Self {
        self.radius_km = radius_km;
        self
    }

    pub fn with_time_window(mut self, minutes: u32) -> Self {
        self.time_window_minutes = minutes;
        self
    }

    /// Reject out-of-range or non-finite parameters.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(QueryError::InvalidLatitude(self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(QueryError::InvalidLongitude(self.longitude));
        }
        if !self.radius_km.is_finite() || !(MIN_RADIUS_KM..=MAX_RADIUS_KM).contains(&self.radius_km)
        {
            return Err(QueryError::InvalidRadius(self.radius_km));
        }
        if !(MIN_TIME_WINDOW_MINUTES..=MAX_TIME_WINDOW_MINUTES).contains(&self.time_window_minutes)
        {
            return Err(QueryError::InvalidTimeWindow(self.time_window_minutes));
        }
        Ok(())
    }
}

/// Ordinal safety level, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Elevated,
    High,
    Extreme,
}

impl SafetyLevel {
    /// Classify by nearest strike distance.
    ///
    /// `< 8` km is extreme, `[8, 16)` high, `[16, 50]` elevated, anything
    /// farther or no strike at all is safe.
    pub fn from_nearest_km(nearest_km: Option<f64>) -> Self {
        match nearest_km {
            Some(d) if d < 8.0 => SafetyLevel::Extreme,
            Some(d) if d < 16.0 => SafetyLevel::High,
            Some(d) if d <= 50.0 => SafetyLevel::Elevated,
            _ => SafetyLevel::Safe,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "safe",
            SafetyLevel::Elevated => "elevated",
            SafetyLevel::High => "high",
            SafetyLevel::Extreme => "extreme",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "No nearby lightning detected. Normal outdoor activity is fine.",
            SafetyLevel::Elevated => {
                "Lightning in the area. Stay alert and be ready to move indoors."
            }
            SafetyLevel::High => {
                "Lightning is close. Move indoors or into a hard-topped vehicle now."
            }
            SafetyLevel::Extreme => {
                "Lightning is very close. Take shelter immediately and stay away from open ground, water and tall objects."
            }
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrikeStatistics {
    pub total: usize,
    pub cloud_to_ground: usize,
    pub intra_cloud: usize,
    pub mean_distance_km: Option<f64>,
    pub nearest_km: Option<f64>,
    pub strikes_per_minute: f64,
    /// Strikes per square kilometre of the search circle.
    pub density_per_km2: f64,
}

impl StrikeStatistics {
    pub fn compute(strikes: &[NearbyStrike], radius_km: f64, window_minutes: u32) -> Self {
        let total = strikes.len();
        let cloud_to_ground = strikes
            .iter()
            .filter(|s| s.strike.amplitude.abs() > CLOUD_TO_GROUND_AMPLITUDE)
            .count();

        let mean_distance_km = (total > 0)
            .then(|| strikes.iter().map(|s| s.distance_km).sum::<f64>() / total as f64);
        let nearest_km = strikes
            .iter()
            .map(|s| s.distance_km)
            .min_by(|a, b| a.total_cmp(b));

        let strikes_per_minute = if window_minutes == 0 {
            0.0
        } else {
            total as f64 / f64::from(window_minutes)
        };
        let area = PI * radius_km * radius_km;
        let density_per_km2 = if area > 0.0 { total as f64 / area } else { 0.0 };

        Self {
            total,
            cloud_to_ground,
            intra_cloud: total - cloud_to_ground,
            mean_distance_km,
            nearest_km,
            strikes_per_minute,
            density_per_km2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyAssessment {
    pub level: SafetyLevel,
    pub nearest_km: Option<f64>,
    pub is_active_thunderstorm: bool,
    pub advice: &'static str,
}

impl SafetyAssessment {
    /// Level from the nearest strike; the storm is active when that strike is
    /// recent or the overall rate is high.
    pub fn assess(strikes: &[NearbyStrike], stats: &StrikeStatistics, now: DateTime<Utc>) -> Self {
        let nearest = strikes
            .iter()
            .min_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        let level = SafetyLevel::from_nearest_km(nearest.map(|s| s.distance_km));

        let recent = nearest.is_some_and(|s| {
            now - s.strike.timestamp <= Duration::minutes(ACTIVE_STORM_RECENCY_MINUTES)
        });

        Self {
            level,
            nearest_km: nearest.map(|s| s.distance_km),
            is_active_thunderstorm: recent || stats.strikes_per_minute > ACTIVE_STORM_RATE,
            advice: level.advice(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Full answer to a lightning activity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightningActivity {
    pub location: Location,
    pub search_radius_km: f64,
    pub time_window_minutes: u32,
    pub strikes: Vec<NearbyStrike>,
    pub statistics: StrikeStatistics,
    pub safety: SafetyAssessment,
    pub source: &'static str,
    pub generated_at: DateTime<Utc>,
}

pub struct QueryEngine<S> {
    source: S,
}

impl<S: StrikeSource> QueryEngine<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Nearby strikes, nearest first. Parameters are validated before any
    /// network activity.
    pub async fn get_lightning_strikes(&self, query: &LightningQuery) -> Result<Vec<NearbyStrike>> {
        query.validate()?;
        Ok(self
            .source
            .fetch_strikes(
                query.latitude,
                query.longitude,
                query.radius_km,
                query.time_window_minutes,
            )
            .await)
    }

    pub async fn get_lightning_activity(&self, query: &LightningQuery) -> Result<LightningActivity> {
        let strikes = self.get_lightning_strikes(query).await?;
        let generated_at = Utc::now();

        let statistics =
            StrikeStatistics::compute(&strikes, query.radius_km, query.time_window_minutes);
        let safety = SafetyAssessment::assess(&strikes, &statistics, generated_at);

        log::debug!(
            "Lightning activity at ({:.4}, {:.4}): {} strikes, level {}",
            query.latitude,
            query.longitude,
            statistics.total,
            safety.level
        );

        Ok(LightningActivity {
            location: Location {
                latitude: query.latitude,
                longitude: query.longitude,
            },
            search_radius_km: query.radius_km,
            time_window_minutes: query.time_window_minutes,
            strikes,
            statistics,
            safety,
            source: DATA_SOURCE,
            generated_at,
        })
    }
}
