use serde::{Deserialize, Serialize};

use crate::ids::ItemId;
use crate::item::FeedItem;

/// Kind of engagement being reported to the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventType {
    Impression,
    ScrollNext,
    ScrollPrev,
    Like,
    ViewOpen,
}

impl FeedEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impression => "impression",
            Self::ScrollNext => "scroll_next",
            Self::ScrollPrev => "scroll_prev",
            Self::Like => "like",
            Self::ViewOpen => "view_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub category_id: String,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EventValidationError {
    #[error("dwell time is only valid on impressions, got {0}")]
    DwellOnNonImpression(&'static str),
    #[error("radius must be a finite, non-negative number: {0}")]
    InvalidRadius(f64),
}

/// A single telemetry record as posted to `/feed/events`.
///
/// Construct through [`FeedEvent::builder`]; the optional fields are checked
/// there rather than trusted from callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub ad_id: ItemId,
    pub event_type: FeedEventType,
    pub position_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_time_ms: Option<u64>,
    pub radius_km: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EventMeta>,
}

impl FeedEvent {
    pub fn builder(
        event_type: FeedEventType,
        item: &FeedItem,
        position_index: usize,
        radius_km: f64,
    ) -> FeedEventBuilder {
        FeedEventBuilder {
            event_type,
            ad_id: item.id.clone(),
            category_id: item.category_id.clone(),
            position_index,
            radius_km,
            dwell_time_ms: None,
        }
    }
}

pub struct FeedEventBuilder {
    event_type: FeedEventType,
    ad_id: ItemId,
    category_id: String,
    position_index: usize,
    radius_km: f64,
    dwell_time_ms: Option<u64>,
}

impl FeedEventBuilder {
    pub fn dwell_ms(mut self, ms: u64) -> Self {
        self.dwell_time_ms = Some(ms);
        self
    }

    pub fn build(self) -> Result<FeedEvent, EventValidationError> {
        if self.dwell_time_ms.is_some() && self.event_type != FeedEventType::Impression {
            return Err(EventValidationError::DwellOnNonImpression(
                self.event_type.as_str(),
            ));
        }
        if !self.radius_km.is_finite() || self.radius_km < 0.0 {
            return Err(EventValidationError::InvalidRadius(self.radius_km));
        }
        let meta = (!self.category_id.is_empty()).then(|| EventMeta {
            category_id: self.category_id,
        });
        Ok(FeedEvent {
            ad_id: self.ad_id,
            event_type: self.event_type,
            position_index: self.position_index,
            dwell_time_ms: self.dwell_time_ms,
            radius_km: self.radius_km,
            meta,
        })
    }
}

/// Request body of `POST /feed/events`.
#[derive(Debug, Serialize)]
pub struct EventBatch<'a> {
    pub events: &'a [FeedEvent],
}
