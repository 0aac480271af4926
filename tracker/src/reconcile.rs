//! Normalisation of the destination, coordinate and invoice shapes producers send.
//!
//! Producers disagree on payload layout. Destinations arrive as
//! `[lat, lng, {endereco, nd}]`, as `{latitude, longitude, ...}` or as a bare
//! `[lat, lng]` pair. Each recognised shape is one variant of [`DestinationShape`];
//! anything else is dropped with a warning instead of failing the whole batch.

use crate::metrics_defs::{DESTINATIONS_DISCARDED, INVOICES_DISCARDED};
use crate::protocol::lenient;
use crate::types::{Destination, InvoicePatch, LatLng};
use serde::Deserialize;
use serde_json::{Map, Value};
use shared::counter;

#[derive(Deserialize)]
struct DestinationMeta {
    #[serde(default, deserialize_with = "lenient::text")]
    endereco: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    nd: Option<String>,
}

#[derive(Deserialize)]
struct ObjectDestination {
    latitude: f64,
    longitude: f64,
    #[serde(flatten)]
    meta: DestinationMeta,
}

/// Recognised destination layouts.
enum DestinationShape {
    /// `[lat, lng, {endereco, nd}]`
    Annotated(f64, f64, DestinationMeta),
    /// `{latitude, longitude, endereco?, nd?}`
    Object(ObjectDestination),
    /// `[lat, lng]`
    Pair(f64, f64),
}

impl DestinationShape {
    fn classify(raw: &Value) -> Option<Self> {
        match raw {
            Value::Array(items) => match items.as_slice() {
                [lat, lng, meta @ Value::Object(_)] => Some(DestinationShape::Annotated(
                    lat.as_f64()?,
                    lng.as_f64()?,
                    DestinationMeta::deserialize(meta).ok()?,
                )),
                [lat, lng] => Some(DestinationShape::Pair(lat.as_f64()?, lng.as_f64()?)),
                _ => None,
            },
            Value::Object(_) => ObjectDestination::deserialize(raw)
                .ok()
                .map(DestinationShape::Object),
            _ => None,
        }
    }

    fn into_destination(self) -> Option<Destination> {
        let (lat, lng, meta) = match self {
            DestinationShape::Annotated(lat, lng, meta) => (lat, lng, Some(meta)),
            DestinationShape::Object(object) => {
                (object.latitude, object.longitude, Some(object.meta))
            }
            DestinationShape::Pair(lat, lng) => (lat, lng, None),
        };
        let point = LatLng::checked(lat, lng)?;
        let (endereco, nd) = meta.map(|m| (m.endereco, m.nd)).unwrap_or_default();

        Some(Destination {
            lat: point.lat,
            lng: point.lng,
            endereco,
            nd,
        })
    }
}

/// Normalises one destination, or `None` if the shape is not recognised.
pub fn normalize_destination(raw: &Value) -> Option<Destination> {
    DestinationShape::classify(raw).and_then(DestinationShape::into_destination)
}

/// Normalises a destination list, discarding unrecognised entries.
///
/// A non-array value is treated as a single destination.
pub fn normalize_destinations(raw: &Value) -> Vec<Destination> {
    let items = match raw {
        Value::Array(items) if !looks_like_single_destination(items) => items.as_slice(),
        Value::Null => return Vec::new(),
        other => std::slice::from_ref(other),
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let destination = normalize_destination(item);
            if destination.is_none() {
                counter!(DESTINATIONS_DISCARDED).increment(1);
                tracing::warn!(index, payload = %item, "Discarding unrecognised destination");
            }
            destination
        })
        .collect()
}

// `destino: [lat, lng]` is a single pair, not a list of two destinations.
fn looks_like_single_destination(items: &[Value]) -> bool {
    items.len() >= 2 && items[0].is_number() && items[1].is_number()
}

/// Parses a bare coordinate: `[lat, lng]`, `{lat, lng}` or `{latitude, longitude}`.
pub fn parse_point(raw: &Value) -> Option<LatLng> {
    match raw {
        Value::Array(items) if items.len() == 2 => {
            LatLng::checked(items[0].as_f64()?, items[1].as_f64()?)
        }
        Value::Object(fields) => {
            let lat = fields.get("lat").or_else(|| fields.get("latitude"))?;
            let lng = fields.get("lng").or_else(|| fields.get("longitude"))?;
            LatLng::checked(lat.as_f64()?, lng.as_f64()?)
        }
        _ => None,
    }
}

/// Builds an invoice patch from one element of a route's `nfs` list.
///
/// Requires an `nd` key; every field the hub does not model is carried in `extra`.
pub fn parse_invoice(raw: &Value) -> Option<InvoicePatch> {
    let Value::Object(fields) = raw else {
        counter!(INVOICES_DISCARDED).increment(1);
        tracing::warn!(payload = %raw, "Discarding invoice that is not an object");
        return None;
    };
    let Some(nd) = fields.get("nd").and_then(lenient::key_from_value) else {
        counter!(INVOICES_DISCARDED).increment(1);
        tracing::warn!(payload = %raw, "Discarding invoice without nd");
        return None;
    };

    let mut extra: Map<String, Value> = fields.clone();
    let mut take = |name: &str| extra.remove(name).filter(|value| !value.is_null());
    take("nd");
    let nfe = take("nfe");
    let status = take("status").and_then(|value| lenient::key_from_value(&value));
    let status_code = take("statusCode");
    let destinatario = take("destinatario");
    let endereco = take("endereco");
    let location = take("location");
    let timestamp = take("timestamp").and_then(|value| lenient::unsigned_from_value(&value));

    Some(InvoicePatch {
        nd,
        nfe,
        status,
        status_code,
        destinatario,
        endereco,
        location,
        timestamp,
        extra,
    })
}

/// Parses every invoice in `raw`, which should be an array.
pub fn parse_invoices(raw: &Value) -> Vec<InvoicePatch> {
    match raw {
        Value::Array(items) => items.iter().filter_map(parse_invoice).collect(),
        Value::Null => Vec::new(),
        other => {
            tracing::warn!(payload = %other, "Expected a list of invoices");
            Vec::new()
        }
    }
}
