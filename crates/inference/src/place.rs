//! Reverse geocoding collaborators.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Human-readable place attributes for a coordinate. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub city: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
    pub country: Option<String>,
}

impl Place {
    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.state.is_none() && self.county.is_none() && self.country.is_none()
    }
}

/// Maps coordinates to place names.
///
/// Must not fail: any internal problem yields `Place::default()`.
pub trait PlaceResolver: Send + Sync + 'static {
    fn resolve(&self, latitude: f64, longitude: f64) -> Place;
}

/// Resolver that never knows anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlaceResolver;

impl PlaceResolver for NoPlaceResolver {
    fn resolve(&self, _latitude: f64, _longitude: f64) -> Place {
        Place::default()
    }
}

#[derive(Debug, Error)]
pub enum GazetteerError {
    #[error("failed to read gazetteer {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("gazetteer row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct GazetteerRow {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    city: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    county: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Clone)]
struct GazetteerEntry {
    latitude: f64,
    longitude: f64,
    place: Place,
}

/// Offline nearest-place resolver over a CSV gazetteer.
///
/// Columns: `latitude,longitude,city,state,county,country`. Lookup is a linear
/// scan by great-circle distance.
#[derive(Debug, Clone, Default)]
pub struct GazetteerResolver {
    entries: Vec<GazetteerEntry>,
}

const EARTH_RADIUS_KM: f64 = 6371.0;

impl GazetteerResolver {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GazetteerError> {
        let path = path.as_ref();
        let reader = csv::Reader::from_path(path).map_err(|source| GazetteerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_csv(reader)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, GazetteerError> {
        Self::from_csv(csv::Reader::from_reader(reader))
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self, GazetteerError> {
        let mut entries = Vec::new();
        for (idx, row) in reader.deserialize::<GazetteerRow>().enumerate() {
            let row = row.map_err(|source| GazetteerError::Row { row: idx + 1, source })?;
            if !(row.latitude.is_finite() && row.longitude.is_finite()) {
                continue;
            }
            entries.push(GazetteerEntry {
                latitude: row.latitude,
                longitude: row.longitude,
                place: Place {
                    city: non_empty(row.city),
                    state: non_empty(row.state),
                    county: non_empty(row.county),
                    country: non_empty(row.country),
                },
            });
        }
        debug!(entries = entries.len(), "gazetteer loaded");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PlaceResolver for GazetteerResolver {
    fn resolve(&self, latitude: f64, longitude: f64) -> Place {
        if !(latitude.is_finite() && longitude.is_finite()) {
            return Place::default();
        }
        self.entries
            .iter()
            .map(|e| (haversine_km(latitude, longitude, e.latitude, e.longitude), e))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, e)| e.place.clone())
            .unwrap_or_default()
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
latitude,longitude,city,state,county,country
48.8566,2.3522,Paris,Ile-de-France,,France
40.7128,-74.0060,New York,New York,New York County,United States
-33.8688,151.2093,Sydney,New South Wales,,Australia
";

    #[test]
    fn resolves_nearest_entry() {
        let resolver = GazetteerResolver::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(resolver.len(), 3);

        let place = resolver.resolve(48.85, 2.29);
        assert_eq!(place.city.as_deref(), Some("Paris"));
        assert_eq!(place.county, None);
        assert_eq!(place.country.as_deref(), Some("France"));

        let place = resolver.resolve(41.0, -73.9);
        assert_eq!(place.city.as_deref(), Some("New York"));
    }

    #[test]
    fn empty_gazetteer_resolves_nothing() {
        let resolver = GazetteerResolver::default();
        assert!(resolver.resolve(0.0, 0.0).is_empty());
    }

    #[test]
    fn non_finite_coordinates_resolve_nothing() {
        let resolver = GazetteerResolver::from_reader(CSV.as_bytes()).unwrap();
        assert!(resolver.resolve(f64::NAN, 2.0).is_empty());
    }

    #[test]
    fn malformed_row_reports_position() {
        let bad = "latitude,longitude,city\n1.0,2.0,A\nnope,3.0,B\n";
        let err = GazetteerResolver::from_reader(bad.as_bytes()).unwrap_err();
        assert!(matches!(err, GazetteerError::Row { row: 2, .. }));
    }

    #[test]
    fn haversine_is_roughly_right() {
        // Paris -> London is ~344 km.
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 344.0).abs() < 5.0, "got {d}");
    }
}
