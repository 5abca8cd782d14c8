//! Geohash encoding, decoding and neighbor lookup.
//!
//! A geohash is a base32 string whose characters interleave longitude and
//! latitude bisection bits. Each extra character shrinks the cell, so a
//! shorter hash is always a coarser cell containing every longer hash that
//! shares its prefix.

use thiserror::Error;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Finest precision supported by [`encode`].
pub const MAX_PRECISION: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum GeohashError {
    #[error("Geohash is empty")]
    Empty,

    #[error("Invalid geohash character '{0}'")]
    InvalidCharacter(char),

    #[error("Geohash precision must be 1-{max}, got {0}", max = MAX_PRECISION)]
    InvalidPrecision(usize),
}

pub type Result<T> = std::result::Result<T, GeohashError>;

/// Rectangular extent of a geohash cell in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl CellBounds {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }
}

/// Encode a coordinate at the given precision (number of characters).
///
/// Coordinates outside the valid range are clamped first.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeohashError::InvalidPrecision(precision));
    }

    let lat = lat.clamp(-90.0, 90.0);
    let lon = lon.clamp(-180.0, 180.0);

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);

    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bit = 0;
    let mut idx = 0usize;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                idx = (idx << 1) | 1;
                lon_lo = mid;
            } else {
                idx <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                idx = (idx << 1) | 1;
                lat_lo = mid;
            } else {
                idx <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;

        bit += 1;
        if bit == 5 {
            hash.push(BASE32[idx] as char);
            bit = 0;
            idx = 0;
        }
    }

    Ok(hash)
}

/// Decode a geohash into the bounds of its cell.
pub fn bounds(hash: &str) -> Result<CellBounds> {
    if hash.is_empty() {
        return Err(GeohashError::Empty);
    }

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.chars() {
        let lower = c.to_ascii_lowercase();
        let idx = BASE32
            .iter()
            .position(|&b| b as char == lower)
            .ok_or(GeohashError::InvalidCharacter(c))?;

        for shift in (0..5).rev() {
            let set = (idx >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if set {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if set {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }

    Ok(CellBounds {
        min_lat: lat_lo,
        min_lon: lon_lo,
        max_lat: lat_hi,
        max_lon: lon_hi,
    })
}

/// Decode a geohash into the coordinate of its cell center.
pub fn decode(hash: &str) -> Result<(f64, f64)> {
    Ok(bounds(hash)?.center())
}

/// Lateral neighbors of a cell at the same precision.
///
/// Longitude wraps across the antimeridian. Cells that would lie beyond a
/// pole are omitted, so polar cells have fewer than eight neighbors.
pub fn neighbors(hash: &str) -> Result<Vec<String>> {
    let cell = bounds(hash)?;
    let (lat, lon) = cell.center();
    let (height, width) = (cell.height(), cell.width());
    let precision = hash.len();

    let mut out = Vec::with_capacity(8);
    for dlat in [-1.0, 0.0, 1.0] {
        for dlon in [-1.0, 0.0, 1.0] {
            if dlat == 0.0 && dlon == 0.0 {
                continue;
            }

            let n_lat = lat + dlat * height;
            if !(-90.0..=90.0).contains(&n_lat) {
                continue;
            }
            let n_lon = wrap_longitude(lon + dlon * width);

            let neighbor = encode(n_lat, n_lon, precision)?;
            if neighbor != hash && !out.contains(&neighbor) {
                out.push(neighbor);
            }
        }
    }

    Ok(out)
}

fn wrap_longitude(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_known_location() {
        // Jutland, Denmark: the classic reference hash
        assert_eq!(encode(57.64911, 10.40744, 11).unwrap(), "u4pruydqqvj");
        // New York City
        assert_eq!(encode(40.7128, -74.0060, 5).unwrap(), "dr5re");
    }

    #[test]
    fn encode_rejects_bad_precision() {
        assert_eq!(encode(0.0, 0.0, 0), Err(GeohashError::InvalidPrecision(0)));
        assert_eq!(
            encode(0.0, 0.0, 13),
            Err(GeohashError::InvalidPrecision(13))
        );
    }

    #[test]
    fn decode_center_lies_inside_bounds() {
        let hash = encode(40.7128, -74.0060, 7).unwrap();
        let cell = bounds(&hash).unwrap();
        assert!(cell.min_lat <= 40.7128 && 40.7128 <= cell.max_lat);
        assert!(cell.min_lon <= -74.0060 && -74.0060 <= cell.max_lon);

        let (lat, lon) = decode(&hash).unwrap();
        assert!((lat - 40.7128).abs() < cell.height());
        assert!((lon + 74.0060).abs() < cell.width());
    }

    #[test]
    fn decode_rejects_invalid_input() {
        assert_eq!(bounds(""), Err(GeohashError::Empty));
        // 'a', 'i', 'l' and 'o' are not part of the alphabet
        assert_eq!(bounds("dra"), Err(GeohashError::InvalidCharacter('a')));
    }

    #[test]
    fn neighbors_of_interior_cell() {
        let n = neighbors("dr5re").unwrap();
        assert_eq!(n.len(), 8);
        for hash in &n {
            assert_eq!(hash.len(), 5);
            assert_ne!(hash, "dr5re");
        }
        // East and north neighbors per the standard neighbor tables
        assert!(n.contains(&"dr5rs".to_string()));
        assert!(n.contains(&"dr5rg".to_string()));
    }

    #[test]
    fn neighbors_wrap_antimeridian() {
        let west_edge = encode(0.0, -179.99, 3).unwrap();
        let n = neighbors(&west_edge).unwrap();
        let wrapped = n
            .iter()
            .map(|h| decode(h).unwrap().1)
            .any(|lon| lon > 170.0);
        assert!(wrapped, "expected a neighbor across the antimeridian");
    }

    #[test]
    fn neighbors_stop_at_pole() {
        let north = encode(89.99, 0.0, 2).unwrap();
        let n = neighbors(&north).unwrap();
        assert_eq!(n.len(), 5);
    }
}
