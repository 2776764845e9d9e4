//! # Geometry Helpers
//!
//! Projection between geographic (WGS84 lon/lat) and projected metric (UTM)
//! coordinates, plus small conversion helpers between `geo` types and the
//! GeoJSON boundary format.
//!
//! All tiling, cropping and dissolving happens in metric coordinates; the
//! transforms here are only applied at the system boundary (project creation
//! corners, final result features).

use geo::{Coord, MapCoords, MultiPolygon, Polygon, Rect};

use crate::types::{EngineError, EngineResult};

// WGS84 ellipsoid.
const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;

fn e2() -> f64 {
    F * (2.0 - F)
}

fn ep2() -> f64 {
    let e2 = e2();
    e2 / (1.0 - e2)
}

/// Central meridian of a UTM zone, in degrees.
fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

/// Project a WGS84 `(lon, lat)` pair (degrees) into UTM easting/northing
/// (meters) for the given zone. Northern hemisphere convention; the project
/// areas this engine serves are all north of the equator.
pub fn to_utm(lon: f64, lat: f64, zone: u8) -> Coord<f64> {
    let e2 = e2();
    let ep2 = ep2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let lat_r = lat.to_radians();
    let dlon = (lon - central_meridian(zone)).to_radians();

    let sin_lat = lat_r.sin();
    let cos_lat = lat_r.cos();
    let tan_lat = lat_r.tan();

    let n = A / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = ep2 * cos_lat * cos_lat;
    let a = cos_lat * dlon;

    let m = A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat_r
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat_r).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat_r).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * lat_r).sin());

    let easting = K0
        * n
        * (a + (1.0 - t + c) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0)
        + FALSE_EASTING;

    let northing = K0
        * (m + n
            * tan_lat
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));

    Coord { x: easting, y: northing }
}

/// Inverse of [`to_utm`]: UTM easting/northing (meters) back to WGS84
/// `(lon, lat)` in degrees.
pub fn to_wgs(easting: f64, northing: f64, zone: u8) -> Coord<f64> {
    let e2 = e2();
    let ep2 = ep2();
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let x = easting - FALSE_EASTING;
    let m = northing / K0;
    let mu = m / (A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let e1 = (1.0 - (1.0 - e2).sqrt()) / (1.0 + (1.0 - e2).sqrt());
    let lat1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = lat1.sin();
    let cos1 = lat1.cos();
    let tan1 = lat1.tan();

    let c1 = ep2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let n1 = A / (1.0 - e2 * sin1 * sin1).sqrt();
    let r1 = A * (1.0 - e2) / (1.0 - e2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * K0);

    let lat = lat1
        - (n1 * tan1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);

    let lon = central_meridian(zone).to_radians()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos1;

    Coord {
        x: lon.to_degrees(),
        y: lat.to_degrees(),
    }
}

/// Reproject every coordinate of a polygon from metric to geographic space.
pub fn polygon_to_wgs(polygon: &Polygon<f64>, zone: u8) -> Polygon<f64> {
    polygon.map_coords(|c| to_wgs(c.x, c.y, zone))
}

/// Reproject every coordinate of a multipolygon from geographic to metric.
pub fn multipolygon_to_utm(mp: &MultiPolygon<f64>, zone: u8) -> MultiPolygon<f64> {
    mp.map_coords(|c| to_utm(c.x, c.y, zone))
}

/// Axis-aligned square with the given south-west corner and edge length.
pub fn square(min_x: f64, min_y: f64, size: f64) -> Rect<f64> {
    Rect::new(
        Coord { x: min_x, y: min_y },
        Coord { x: min_x + size, y: min_y + size },
    )
}

/// Grow a rectangle symmetrically by `margin` on every side.
pub fn expand(rect: &Rect<f64>, margin: f64) -> Rect<f64> {
    Rect::new(
        Coord { x: rect.min().x - margin, y: rect.min().y - margin },
        Coord { x: rect.max().x + margin, y: rect.max().y + margin },
    )
}

/// Decode a GeoJSON geometry into a `MultiPolygon`, accepting both Polygon
/// and MultiPolygon inputs. Anything else is a protocol violation of the
/// boundary contract.
pub fn multipolygon_from_geojson(geometry: &geojson::Geometry) -> EngineResult<MultiPolygon<f64>> {
    let decoded = geo::Geometry::<f64>::try_from(geometry.value.clone())
        .map_err(|e| EngineError::Geometry(format!("unsupported geometry: {e}")))?;
    match decoded {
        geo::Geometry::Polygon(p) => Ok(MultiPolygon(vec![p])),
        geo::Geometry::MultiPolygon(mp) => Ok(mp),
        other => Err(EngineError::Geometry(format!(
            "expected (Multi)Polygon, got {other:?}"
        ))),
    }
}

/// Collect every (multi)polygon feature of a GeoJSON feature collection into
/// one `MultiPolygon`. Features without geometry are skipped.
pub fn multipolygon_from_features(fc: &geojson::FeatureCollection) -> EngineResult<MultiPolygon<f64>> {
    let mut polygons = Vec::new();
    for feature in &fc.features {
        if let Some(geometry) = &feature.geometry {
            polygons.extend(multipolygon_from_geojson(geometry)?.0);
        }
    }
    Ok(MultiPolygon(polygons))
}

/// Encode a metric polygon as a GeoJSON geometry in geographic coordinates.
pub fn polygon_to_geojson_wgs(polygon: &Polygon<f64>, zone: u8) -> geojson::Geometry {
    let wgs = polygon_to_wgs(polygon, zone);
    geojson::Geometry::new(geojson::Value::from(&wgs))
}
