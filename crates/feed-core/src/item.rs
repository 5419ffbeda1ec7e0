use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{Cursor, ItemId};

/// A single historical price of an item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub price: f64,
    pub changed_at: DateTime<Utc>,
}

/// A content item as delivered by the feed backend.
///
/// Only the attributes the session needs for filtering and telemetry tagging
/// are modelled; everything else a card renders is the host's concern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: ItemId,
    pub category_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_free_giveaway: bool,
    #[serde(default)]
    pub is_farmer: bool,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub price_history: Vec<PricePoint>,
}

impl FeedItem {
    pub fn is_free(&self) -> bool {
        self.is_free_giveaway || self.price == Some(0.0)
    }

    pub fn is_discounted(&self) -> bool {
        !self.price_history.is_empty()
    }
}

/// One page of `GET /feed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
    #[serde(default)]
    pub has_more: bool,
}

impl FeedPage {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        }
    }
}

/// Opaque position context threaded through every fetch and event.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoContext {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

impl GeoContext {
    pub fn new(lat: f64, lng: f64, radius_km: f64) -> Self {
        Self { lat, lng, radius_km }
    }
}
