//! Spatial tile indexer
//!
//! Converts a circular search area into a bounded set of geohash tiles.
//! Larger areas select coarser tiles so that the subscription footprint
//! never exceeds the caller's tile budget.

use std::collections::{BTreeSet, VecDeque};

use crate::geo::KM_PER_DEGREE;
use crate::geohash::{self, MAX_PRECISION};

/// A geohash cell identifier. Shorter strings are coarser cells.
pub type Tile = String;

/// Hard ceiling on tiles produced by a single expansion.
pub const DEFAULT_MAX_EXPANSION: usize = 10_000;

/// Precision used when no precision level fits the tile budget.
pub const DEFAULT_FALLBACK_PRECISION: usize = 3;

/// Rectangle enclosing a search circle, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Enclosing rectangle of a circle of `radius_km` around `(lat, lon)`.
///
/// The longitude span widens by `1/cos(lat)` as meridians converge. Both
/// axes are clamped to the valid coordinate range.
pub fn bounding_box(lat: f64, lon: f64, radius_km: f64) -> BoundingBox {
    let lat_delta = radius_km / KM_PER_DEGREE;
    let cos_lat = lat.to_radians().cos();
    let lon_delta = if cos_lat.abs() < 1e-9 {
        360.0
    } else {
        lat_delta / cos_lat.abs()
    };

    BoundingBox {
        min_lat: (lat - lat_delta).max(-90.0),
        min_lon: (lon - lon_delta).max(-180.0),
        max_lat: (lat + lat_delta).min(90.0),
        max_lon: (lon + lon_delta).min(180.0),
    }
}

/// Map a tile onto the feed's hierarchical topic space.
///
/// `"d7x"` under prefix `"blitzortung/1.1"` becomes
/// `"blitzortung/1.1/d/7/x/#"`.
pub fn tile_topic(prefix: &str, tile: &str) -> String {
    let mut topic = String::with_capacity(prefix.len() + tile.len() * 2 + 2);
    topic.push_str(prefix.trim_end_matches('/'));
    for c in tile.chars() {
        topic.push('/');
        topic.push(c);
    }
    topic.push_str("/#");
    topic
}

/// Stateless tile selection bounded by an expansion cap.
#[derive(Debug, Clone, Copy)]
pub struct TileIndexer {
    max_expansion: usize,
    fallback_precision: usize,
}

impl Default for TileIndexer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXPANSION, DEFAULT_FALLBACK_PRECISION)
    }
}

impl TileIndexer {
    pub fn new(max_expansion: usize, fallback_precision: usize) -> Self {
        Self {
            max_expansion: max_expansion.max(1),
            fallback_precision: fallback_precision.clamp(1, MAX_PRECISION),
        }
    }

    /// Tiles at `precision` whose centers fall inside the search rectangle.
    ///
    /// Breadth-first expansion from the center tile through lateral
    /// neighbors. The center tile is always included. Expansion stops once
    /// the expansion cap is reached.
    pub fn tiles_covering(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        precision: usize,
    ) -> BTreeSet<Tile> {
        let tiles = self.expand(lat, lon, radius_km, precision, self.max_expansion);
        if tiles.len() >= self.max_expansion {
            log::warn!(
                "Tile expansion hit cap of {} at precision {} (radius {} km)",
                self.max_expansion,
                precision,
                radius_km
            );
        }
        tiles
    }

    /// Breadth-first cover holding at most `limit` tiles.
    fn expand(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        precision: usize,
        limit: usize,
    ) -> BTreeSet<Tile> {
        let mut tiles = BTreeSet::new();

        let center = match geohash::encode(lat, lon, precision) {
            Ok(hash) => hash,
            Err(e) => {
                log::debug!("Cannot encode center ({}, {}): {}", lat, lon, e);
                return tiles;
            }
        };

        let bbox = bounding_box(lat, lon, radius_km);
        let mut queue = VecDeque::new();
        tiles.insert(center.clone());
        queue.push_back(center);

        'expand: while let Some(tile) = queue.pop_front() {
            let neighbors = match geohash::neighbors(&tile) {
                Ok(n) => n,
                Err(_) => continue,
            };

            for neighbor in neighbors {
                if tiles.len() >= limit {
                    break 'expand;
                }
                if tiles.contains(&neighbor) {
                    continue;
                }
                let Ok((n_lat, n_lon)) = geohash::decode(&neighbor) else {
                    continue;
                };
                if bbox.contains(n_lat, n_lon) {
                    tiles.insert(neighbor.clone());
                    queue.push_back(neighbor);
                }
            }
        }

        tiles
    }

    /// Finest tile set covering the area that still fits within `max_tiles`.
    ///
    /// Precision increases from 1 until the tile count would exceed the
    /// budget. Never returns an empty set or more than `max_tiles` tiles.
    pub fn select_subscription_tiles(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        max_tiles: usize,
    ) -> BTreeSet<Tile> {
        let max_tiles = max_tiles.max(1);
        // One tile past the budget is enough to reject a precision level
        let limit = max_tiles.saturating_add(1).min(self.max_expansion);
        let mut best: Option<BTreeSet<Tile>> = None;

        for precision in 1..=MAX_PRECISION {
            let tiles = self.expand(lat, lon, radius_km, precision, limit);
            if tiles.len() > max_tiles {
                break;
            }
            if !tiles.is_empty() {
                best = Some(tiles);
            }
        }

        match best {
            Some(tiles) => tiles,
            None => {
                log::debug!(
                    "No precision fits {} tiles for ({}, {}) r={} km, using single tile",
                    max_tiles,
                    lat,
                    lon,
                    radius_km
                );
                geohash::encode(lat, lon, self.fallback_precision)
                    .into_iter()
                    .collect()
            }
        }
    }
}
