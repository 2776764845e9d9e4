//! # Result Aggregator
//!
//! Merges per-tile result features into one city-wide feature collection.
//! Features carrying the same (rounded) value are dissolved into a single
//! multipolygon, so the output size depends on the value distribution, not
//! on the tile count.
//!
//! The merge is order-independent: tile results are sorted by tile id and
//! value buckets are iterated in sorted order, so any arrival order of the
//! per-tile pipelines produces the same output.

use std::collections::BTreeMap;

use geo::{BooleanOps, MultiPolygon};
use tracing::debug;

use crate::geometry::multipolygon_from_geojson;
use crate::project::TileResult;
use crate::types::{EngineError, EngineResult};

/// Dissolve tile results into one feature collection, one feature per
/// distinct value. Empty input yields an explicit empty collection.
pub fn merge(results: &[TileResult]) -> EngineResult<geojson::FeatureCollection> {
    let mut ordered: Vec<&TileResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.tile_id);

    // Values were rounded to one decimal when the tiles were cropped, so
    // bucketing by value * 10 is exact.
    let mut buckets: BTreeMap<i64, MultiPolygon<f64>> = BTreeMap::new();

    for result in ordered {
        for feature in &result.features.features {
            let Some(geometry) = &feature.geometry else { continue };
            let value = feature
                .properties
                .as_ref()
                .and_then(|p| p.get("value"))
                .and_then(|v| v.as_f64())
                .ok_or_else(|| {
                    EngineError::Geometry(format!(
                        "tile {} result feature has no numeric value",
                        result.tile_id
                    ))
                })?;

            let bucket = (value * 10.0).round() as i64;
            let mp = multipolygon_from_geojson(geometry)?;
            match buckets.remove(&bucket) {
                Some(existing) => {
                    buckets.insert(bucket, existing.union(&mp));
                }
                None => {
                    buckets.insert(bucket, mp);
                }
            }
        }
    }

    debug!("dissolved {} tile results into {} value buckets", results.len(), buckets.len());

    let features = buckets
        .into_iter()
        .map(|(bucket, mp)| geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&mp))),
            id: None,
            properties: Some(
                [("value".to_string(), serde_json::json!(bucket as f64 / 10.0))]
                    .into_iter()
                    .collect(),
            ),
            foreign_members: None,
        })
        .collect();

    Ok(geojson::FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}
