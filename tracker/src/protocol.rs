//! Named-message envelopes exchanged over the websocket.
//!
//! Every frame is `{"event": "<name>", "data": <payload>}`.

use crate::types::{
    BackupLogEntry, Destination, Device, DisconnectionLogEntry, RouteRecord, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
    #[error("binary frame is not utf-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Web,
    Mobile,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Inbound {
    ClientType(ClientRole),
    PosicaoAtual(PositionUpdate),
    RouteData(RoutePayload),
    TrackingStarted(TrackingSignal),
    TrackingStopped(TrackingSignal),
    NfStatusChanged(StatusChange),
    NfBaixa(StatusChange),
    PainelBaixaRealizada(StatusChange),
    DeliveryStatusUpdate(StatusChange),
    RouteProgressUpdate(Value),
}

impl Inbound {
    pub fn name(&self) -> &'static str {
        match self {
            Inbound::ClientType(_) => "client-type",
            Inbound::PosicaoAtual(_) => "posicao-atual",
            Inbound::RouteData(_) => "route-data",
            Inbound::TrackingStarted(_) => "tracking-started",
            Inbound::TrackingStopped(_) => "tracking-stopped",
            Inbound::NfStatusChanged(_) => "nf-status-changed",
            Inbound::NfBaixa(_) => "nf-baixa",
            Inbound::PainelBaixaRealizada(_) => "painel-baixa-realizada",
            Inbound::DeliveryStatusUpdate(_) => "delivery-status-update",
            Inbound::RouteProgressUpdate(_) => "route-progress-update",
        }
    }
}

/// `posicao-atual`. Coordinates are kept raw and normalised by the hub, so one bad
/// field does not reject the whole update.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_name: Option<String>,
    pub origem: Option<Value>,
    pub destino: Option<Value>,
    pub destinos: Option<Value>,
    pub coords: Option<Value>,
    #[serde(default, deserialize_with = "lenient::unsigned")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePayload {
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_id: Option<String>,
    pub destinos: Option<Value>,
    pub nfs: Option<Value>,
    pub rota: Option<Value>,
    #[serde(default, deserialize_with = "lenient::unsigned")]
    pub total_destinos: Option<u64>,
}

/// `tracking-started` and `tracking-stopped`.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSignal {
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_name: Option<String>,
    pub route_data: Option<RoutePayload>,
}

/// Every invoice status variant (`nf-status-changed`, `nf-baixa`,
/// `painel-baixa-realizada`, `delivery-status-update`).
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    #[serde(default, deserialize_with = "lenient::text")]
    pub device_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub nd: Option<String>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub status: Option<String>,
    pub status_code: Option<Value>,
    pub location: Option<Value>,
    #[serde(default, deserialize_with = "lenient::unsigned")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient::text")]
    pub source: Option<String>,
}

pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn decode_binary(bytes: &[u8]) -> Result<Inbound, ProtocolError> {
    decode(std::str::from_utf8(bytes)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView<'a> {
    pub device_id: &'a str,
    #[serde(flatten)]
    pub device: &'a Device,
    pub route_data: Option<&'a RouteRecord>,
}

#[derive(Debug, Serialize)]
pub struct Snapshot<'a> {
    pub devices: Vec<DeviceView<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNotice<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<&'a str>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus<'a> {
    pub device_id: &'a str,
    pub device_name: &'a str,
    pub status: &'static str,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReceived<'a> {
    pub device_id: &'a str,
    pub total_destinos: u64,
    pub nfs_count: usize,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceNotice<'a> {
    pub device_id: &'a str,
    pub nd: &'a str,
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<&'a Value>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfirmation<'a> {
    pub device_id: &'a str,
    pub nd: &'a str,
    pub status: &'a str,
    pub success: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecalculationNeeded<'a> {
    pub device_id: &'a str,
    pub nd: &'a str,
    pub status: &'a str,
    pub remaining_destinos: Vec<&'a Destination>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupLogs<'a> {
    pub device_id: &'a str,
    pub logs: &'a VecDeque<BackupLogEntry>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectionLog<'a> {
    pub logs: &'a [DisconnectionLogEntry],
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Outbound<'a> {
    AllDevicesData(Snapshot<'a>),
    RouteReceived(RouteReceived<'a>),
    TrackingStatus(TrackingStatus<'a>),
    NfStatusUpdate(InvoiceNotice<'a>),
    NfBaixaNotification(InvoiceNotice<'a>),
    NfBaixaConfirmation(DeliveryConfirmation<'a>),
    PainelAtualizacaoImediata(InvoiceNotice<'a>),
    DeliveryNotification(InvoiceNotice<'a>),
    RouteUpdate(&'a Value),
    RouteRecalculationNeeded(RecalculationNeeded<'a>),
    BackupLogs(BackupLogs<'a>),
    DeviceConnected(DeviceNotice<'a>),
    DeviceDisconnected(&'a DisconnectionLogEntry),
    DeviceDisconnectionLog(DisconnectionLog<'a>),
}

/// A serialised frame, shared between every consumer it is pushed to.
pub type Frame = Arc<str>;

impl Outbound<'_> {
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        Ok(serde_json::to_string(self)?.into())
    }
}

/// Field decoders that accept the loosely typed values producers send instead of
/// rejecting the whole message.
pub mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Strings and numbers become text; anything else is treated as absent.
    pub fn key_from_value(value: &Value) -> Option<String> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Non-negative numbers; floats are truncated.
    pub fn unsigned_from_value(value: &Value) -> Option<u64> {
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }

    pub fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(key_from_value))
    }

    pub fn unsigned<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(unsigned_from_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_client_type() {
        let event = decode(r#"{"event":"client-type","data":"web"}"#).unwrap();
        assert_eq!(event, Inbound::ClientType(ClientRole::Web));
        assert!(decode(r#"{"event":"client-type","data":"admin"}"#).is_err());
    }

    #[test]
    fn decode_position_update() {
        let frame = json!({
            "event": "posicao-atual",
            "data": {
                "deviceId": "A",
                "deviceName": "Van 1",
                "origem": [1, 2],
                "coords": [10, 20],
                "timestamp": 1000,
                "destinoTexto": "ignored"
            }
        });
        let Inbound::PosicaoAtual(update) = decode(&frame.to_string()).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(update.device_id.as_deref(), Some("A"));
        assert_eq!(update.device_name.as_deref(), Some("Van 1"));
        assert_eq!(update.coords, Some(json!([10, 20])));
        assert_eq!(update.timestamp, Some(1000));
        assert_eq!(update.destinos, None);
    }

    #[test]
    fn loosely_typed_fields_do_not_reject_the_message() {
        let frame = json!({
            "event": "nf-baixa",
            "data": {"deviceId": 42, "nd": 9001, "status": "entregue", "timestamp": "yesterday"}
        });
        let Inbound::NfBaixa(change) = decode(&frame.to_string()).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(change.device_id.as_deref(), Some("42"));
        assert_eq!(change.nd.as_deref(), Some("9001"));
        assert_eq!(change.timestamp, None);
    }

    #[test]
    fn unknown_events_and_garbage_are_errors() {
        assert!(decode(r#"{"event":"self-destruct","data":{}}"#).is_err());
        assert!(decode("not json").is_err());
        assert!(decode_binary(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn route_progress_is_opaque() {
        let frame = json!({"event": "route-progress-update", "data": {"anything": [1, 2]}});
        assert_eq!(
            decode(&frame.to_string()).unwrap(),
            Inbound::RouteProgressUpdate(json!({"anything": [1, 2]}))
        );
    }

    #[test]
    fn outbound_envelope() {
        let payload = json!({"step": 3});
        let frame = Outbound::RouteUpdate(&payload).encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"event": "route-update", "data": {"step": 3}}));

        let frame = Outbound::TrackingStatus(TrackingStatus {
            device_id: "A",
            device_name: "Van",
            status: "started",
            timestamp: 7,
        })
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "tracking-status");
        assert_eq!(value["data"]["deviceId"], "A");
    }
}
