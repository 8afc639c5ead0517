use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column order of the transformed artifact.
pub const CSV_COLUMNS: [&str; 8] = [
    "id",
    "name",
    "symbol",
    "current_price",
    "market_cap",
    "total_volume",
    "last_updated",
    "processed_at",
];

/// Fields every raw asset object must carry for the transform to accept it.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "id",
    "name",
    "symbol",
    "current_price",
    "market_cap",
    "total_volume",
    "last_updated",
];

/// One asset row of a transformed market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshotRecord {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub current_price: f64,
    pub market_cap: f64,
    pub total_volume: f64,
    pub last_updated: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}
