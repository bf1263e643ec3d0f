//! Built-in job handlers.

use anyhow::{anyhow, Result};
use serde_derive::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPool;

/// Diagnostic handler: echoes the payload back.
pub async fn ping(_db: PgPool, payload: Value) -> Result<Value> {
    Ok(json!({"ok": true, "payload": payload}))
}

#[derive(Debug, Deserialize)]
struct LocationPayload {
    lat: f64,
    lon: f64,
}

/// Upsert a deduplicated coordinate row.
///
/// Coordinates are rounded to 3 decimals and keyed by their fixed-precision
/// rendering, so payloads that round to the same point share one
/// `locations` row. An existing key returns the existing id.
pub async fn location_upsert(db: PgPool, payload: Value) -> Result<Value> {
    let location: LocationPayload =
        serde_json::from_value(payload).map_err(|e| anyhow!("invalid location payload: {}", e))?;

    if !(-90.0..=90.0).contains(&location.lat) {
        return Err(anyhow!(
            "lat must be within [-90, 90], got {}",
            location.lat
        ));
    }
    if !(-180.0..=180.0).contains(&location.lon) {
        return Err(anyhow!(
            "lon must be within [-180, 180], got {}",
            location.lon
        ));
    }

    let lat = round3(location.lat);
    let lon = round3(location.lon);
    let location_key = format!("{:.3},{:.3}", lat, lon);

    let upsert_query = r#"
INSERT INTO locations (key, lat, lon)
VALUES ($1, $2, $3)
ON CONFLICT (key) DO UPDATE
SET
    lat = EXCLUDED.lat,
    lon = EXCLUDED.lon
RETURNING id
    "#;

    let (location_id,): (i64,) = sqlx::query_as(upsert_query)
        .bind(&location_key)
        .bind(lat)
        .bind(lon)
        .fetch_one(&db)
        .await?;

    Ok(json!({
        "locationId": location_id,
        "locationKey": location_key,
        "lat": lat,
        "lon": lon,
    }))
}

/// Round to 3 decimals, coercing -0.0 to 0.0 so the key rendering has a
/// stable sign on either side of the zero meridians.
fn round3(value: f64) -> f64 {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}
