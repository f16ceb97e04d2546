use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Lifecycle states of a trip. `can_transition_to` is the single gate
/// every operation goes through; the table below is the whole policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Requested,
    DriverAssigned,
    DriverAccepted,
    PickupEnRoute,
    InProgress,
    Completed,
    CancelledByRider,
    CancelledByDriver,
}

impl TripStatus {
    pub fn can_transition_to(self, next: TripStatus) -> bool {
        use TripStatus::*;
        matches!(
            (self, next),
            (Requested, DriverAssigned | CancelledByRider)
                | (
                    DriverAssigned,
                    DriverAccepted | PickupEnRoute | CancelledByRider | CancelledByDriver
                )
                | (
                    DriverAccepted,
                    PickupEnRoute | InProgress | CancelledByRider | CancelledByDriver
                )
                | (
                    PickupEnRoute,
                    InProgress | CancelledByRider | CancelledByDriver
                )
                | (InProgress, Completed | CancelledByDriver)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TripStatus::Completed | TripStatus::CancelledByRider | TripStatus::CancelledByDriver
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripStatus::Requested => "REQUESTED",
            TripStatus::DriverAssigned => "DRIVER_ASSIGNED",
            TripStatus::DriverAccepted => "DRIVER_ACCEPTED",
            TripStatus::PickupEnRoute => "PICKUP_EN_ROUTE",
            TripStatus::InProgress => "IN_PROGRESS",
            TripStatus::Completed => "COMPLETED",
            TripStatus::CancelledByRider => "CANCELLED_BY_RIDER",
            TripStatus::CancelledByDriver => "CANCELLED_BY_DRIVER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REQUESTED" => Some(TripStatus::Requested),
            "DRIVER_ASSIGNED" => Some(TripStatus::DriverAssigned),
            "DRIVER_ACCEPTED" => Some(TripStatus::DriverAccepted),
            "PICKUP_EN_ROUTE" => Some(TripStatus::PickupEnRoute),
            "IN_PROGRESS" => Some(TripStatus::InProgress),
            "COMPLETED" => Some(TripStatus::Completed),
            "CANCELLED_BY_RIDER" => Some(TripStatus::CancelledByRider),
            "CANCELLED_BY_DRIVER" => Some(TripStatus::CancelledByDriver),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Rider,
    Driver,
}

impl CancelReason {
    pub fn cancel_status(self) -> TripStatus {
        match self {
            CancelReason::Rider => TripStatus::CancelledByRider,
            CancelReason::Driver => TripStatus::CancelledByDriver,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Rider => "rider",
            CancelReason::Driver => "driver",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rider" => Some(CancelReason::Rider),
            "driver" => Some(CancelReason::Driver),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trip {
    pub id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_type: String,
    pub status: TripStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub accepted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancelled_by: Option<CancelReason>,
    pub price_cents: i64,
    pub version: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripEventType {
    TripRequested,
    DriverAssigned,
    DriverAccepted,
    TripStarted,
    TripFinished,
    TripCancelled,
}

impl TripEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            TripEventType::TripRequested => "TripRequested",
            TripEventType::DriverAssigned => "DriverAssigned",
            TripEventType::DriverAccepted => "DriverAccepted",
            TripEventType::TripStarted => "TripStarted",
            TripEventType::TripFinished => "TripFinished",
            TripEventType::TripCancelled => "TripCancelled",
        }
    }
}

/// Append-only record backing the outbox. `id` is assigned by the store
/// on persist and stays zero for events that have not been written yet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TripEvent {
    pub id: i64,
    pub trip_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: TripEventType,
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl TripEvent {
    /// The wire shape published to the bus.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "trip_id": self.trip_id,
            "type": self.event_type.as_str(),
            "created_at": self.created_at.format(&time::format_description::well_known::Rfc3339).unwrap_or_default(),
            "payload": self.payload,
        })
    }
}
