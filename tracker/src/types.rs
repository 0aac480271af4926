use crate::status;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;

pub type DeviceId = String;
pub type ConnectionId = String;

/// Milliseconds since the unix epoch, as sent by producers.
pub type Timestamp = u64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    /// Returns `None` unless both components are finite numbers.
    pub fn checked(lat: f64, lng: f64) -> Option<Self> {
        (lat.is_finite() && lng.is_finite()).then_some(LatLng { lat, lng })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_new_segment: bool,
}

impl Position {
    pub fn new(point: LatLng, timestamp: Timestamp) -> Self {
        Position {
            lat: point.lat,
            lng: point.lng,
            timestamp,
            is_new_segment: false,
        }
    }

    pub fn point(&self) -> LatLng {
        LatLng {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Destination {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endereco: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nd: Option<String>,
}

/// A delivery order ("nota fiscal") keyed by `nd`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub nd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nfe: Option<Value>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinatario: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endereco: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    pub timestamp: Timestamp,
    /// Delivery metadata the hub does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields of an invoice update. Absent fields leave the stored value untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvoicePatch {
    pub nd: String,
    pub nfe: Option<Value>,
    pub status: Option<String>,
    pub status_code: Option<Value>,
    pub destinatario: Option<Value>,
    pub endereco: Option<Value>,
    pub location: Option<Value>,
    pub timestamp: Option<Timestamp>,
    pub extra: Map<String, Value>,
}

impl InvoicePatch {
    pub fn status(nd: impl Into<String>, status: impl Into<String>) -> Self {
        InvoicePatch {
            nd: nd.into(),
            status: Some(status.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Delivery {
    pub nd: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    pub timestamp: Timestamp,
    pub source: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub positions: VecDeque<Position>,
    pub origem: Option<LatLng>,
    pub destinos: Vec<Destination>,
    pub nfs: Vec<Invoice>,
    pub entregas: Vec<Delivery>,
    pub color: String,
    pub name: String,
    pub last_update: Timestamp,
}

impl Device {
    pub fn new(name: String, color: String, now: Timestamp) -> Self {
        Device {
            positions: VecDeque::new(),
            origem: None,
            destinos: Vec::new(),
            nfs: Vec::new(),
            entregas: Vec::new(),
            color,
            name,
            last_update: now,
        }
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.positions.back()
    }

    pub fn invoice(&self, nd: &str) -> Option<&Invoice> {
        self.nfs.iter().find(|nf| nf.nd == nd)
    }

    /// Destinations still to be visited: those without an invoice key, or whose
    /// invoice is not fulfilled.
    pub fn remaining_destinations(&self) -> Vec<&Destination> {
        self.destinos
            .iter()
            .filter(|destination| match &destination.nd {
                Some(nd) => !self
                    .invoice(nd)
                    .is_some_and(|nf| status::is_fulfilled(&nf.status)),
                None => true,
            })
            .collect()
    }
}

/// Route metadata kept next to each device and cleared with it.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rota: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_destinos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<Timestamp>,
    pub tracking_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupLogEntry {
    pub timestamp: Timestamp,
    pub position: LatLng,
    pub link: String,
    pub is_offline: bool,
    pub device_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectionLogEntry {
    pub device_id: DeviceId,
    pub device_name: String,
    pub last_position: Position,
    pub timestamp: Timestamp,
}

/// Link to a map centered on `point`, attached to backup log entries.
pub fn map_link(point: LatLng) -> String {
    format!("https://www.google.com/maps?q={},{}", point.lat, point.lng)
}
