//! In-memory registry of devices and their route metadata.

use crate::config::TrackingConfig;
use crate::protocol::{DeviceView, Snapshot};
use crate::status::PENDING;
use crate::types::{
    Delivery, Destination, Device, DeviceId, Invoice, InvoicePatch, LatLng, Position, RouteRecord,
    Timestamp,
};
use indexmap::IndexMap;
use indexmap::map::Entry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// Devices keyed by id, in creation order. Route metadata lives in a second map with
/// the same keys and is always removed together with the device.
///
/// Every mutating operation creates the device if it is unknown and stamps
/// `last_update` with `now`.
pub struct DeviceStore {
    devices: IndexMap<DeviceId, Device>,
    routes: IndexMap<DeviceId, RouteRecord>,
    palette: Vec<String>,
    max_positions: usize,
    segment_gap_ms: u64,
}

impl DeviceStore {
    pub fn new(settings: &TrackingConfig) -> Self {
        DeviceStore {
            devices: IndexMap::new(),
            routes: IndexMap::new(),
            palette: settings.palette.clone(),
            max_positions: settings.max_positions,
            segment_gap_ms: settings.segment_gap_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    pub fn route(&self, id: &str) -> Option<&RouteRecord> {
        self.routes.get(id)
    }

    /// Returns the device, creating it with the next palette color when absent.
    /// The flag is true when the device was created by this call.
    pub fn get_or_create(
        &mut self,
        id: &str,
        name: Option<&str>,
        now: Timestamp,
    ) -> (&mut Device, bool) {
        let count = self.devices.len();
        match self.devices.entry(id.to_string()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let color = self
                    .palette
                    .get(count % self.palette.len().max(1))
                    .cloned()
                    .unwrap_or_else(|| "blue".into());
                let name = name
                    .filter(|name| !name.trim().is_empty())
                    .map(String::from)
                    .unwrap_or_else(|| format!("Device {}", count + 1));

                tracing::info!(device_id = %id, %name, %color, "Tracking new device");
                (entry.insert(Device::new(name, color, now)), true)
            }
        }
    }

    fn device_mut(&mut self, id: &str, now: Timestamp) -> &mut Device {
        let (device, _) = self.get_or_create(id, None, now);
        device.last_update = now;
        device
    }

    /// Appends a sample and trims history to the newest `max_positions`.
    ///
    /// Returns true when the sample was marked as the start of a new segment because
    /// it arrived more than `segment_gap_ms` after the previous one.
    pub fn upsert_position(
        &mut self,
        id: &str,
        point: LatLng,
        timestamp: Timestamp,
        now: Timestamp,
    ) -> bool {
        let max_positions = self.max_positions;
        let segment_gap_ms = self.segment_gap_ms;
        let device = self.device_mut(id, now);

        let mut sample = Position::new(point, timestamp);
        if let Some(last) = device.positions.back() {
            let gap = timestamp.saturating_sub(last.timestamp);
            if gap > segment_gap_ms {
                tracing::info!(device_id = %id, gap_ms = gap, "Time gap detected, starting new segment");
                sample.is_new_segment = true;
            }
        }
        let new_segment = sample.is_new_segment;

        device.positions.push_back(sample);
        while device.positions.len() > max_positions {
            device.positions.pop_front();
        }

        new_segment
    }

    /// Sets the origin unless one is already known.
    pub fn set_origin(&mut self, id: &str, origin: LatLng, now: Timestamp) -> bool {
        let device = self.device_mut(id, now);
        if device.origem.is_some() {
            return false;
        }
        device.origem = Some(origin);
        true
    }

    /// Sets the destinations only while none are known, so a later update carrying a
    /// partial or stale list cannot replace the route received first.
    pub fn set_destinations(
        &mut self,
        id: &str,
        destinations: Vec<Destination>,
        now: Timestamp,
    ) -> bool {
        let device = self.device_mut(id, now);
        if !device.destinos.is_empty() || destinations.is_empty() {
            return false;
        }
        device.destinos = destinations;
        true
    }

    /// Updates the invoice with the same `nd` in place, or appends a new one with
    /// `pending` status and `now` as defaults.
    pub fn upsert_invoice(&mut self, id: &str, patch: InvoicePatch, now: Timestamp) -> Upsert {
        let device = self.device_mut(id, now);

        if let Some(existing) = device.nfs.iter_mut().find(|nf| nf.nd == patch.nd) {
            merge_invoice(existing, patch);
            return Upsert::Updated;
        }

        device.nfs.push(Invoice {
            nd: patch.nd,
            nfe: patch.nfe,
            status: patch.status.unwrap_or_else(|| PENDING.to_string()),
            status_code: patch.status_code,
            destinatario: patch.destinatario,
            endereco: patch.endereco,
            location: patch.location,
            timestamp: patch.timestamp.unwrap_or(now),
            extra: patch.extra,
        });
        Upsert::Inserted
    }

    pub fn record_delivery(&mut self, id: &str, delivery: Delivery, now: Timestamp) {
        self.device_mut(id, now).entregas.push(delivery);
    }

    /// Route metadata for a device, created empty on first access.
    pub fn route_mut(&mut self, id: &str) -> &mut RouteRecord {
        self.routes.entry(id.to_string()).or_default()
    }

    pub fn remove(&mut self, id: &str) -> Option<Device> {
        self.routes.shift_remove(id);
        self.devices.shift_remove(id)
    }

    /// Drops every device and route record, returning how many devices were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.devices.len();
        self.devices.clear();
        self.routes.clear();
        removed
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            devices: self
                .devices
                .iter()
                .map(|(id, device)| DeviceView {
                    device_id: id,
                    device,
                    route_data: self.routes.get(id),
                })
                .collect(),
        }
    }
}

fn merge_invoice(existing: &mut Invoice, patch: InvoicePatch) {
    fn set<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    set(&mut existing.nfe, patch.nfe);
    set(&mut existing.status_code, patch.status_code);
    set(&mut existing.destinatario, patch.destinatario);
    set(&mut existing.endereco, patch.endereco);
    set(&mut existing.location, patch.location);
    if let Some(status) = patch.status {
        existing.status = status;
    }
    if let Some(timestamp) = patch.timestamp {
        existing.timestamp = timestamp;
    }
    existing.extra.extend(patch.extra);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> DeviceStore {
        DeviceStore::new(&TrackingConfig::default())
    }

    fn point(lat: f64, lng: f64) -> LatLng {
        LatLng { lat, lng }
    }

    #[test]
    fn creation_assigns_palette_colors_round_robin() {
        let mut settings = TrackingConfig::default();
        settings.palette = vec!["red".into(), "blue".into()];
        let mut store = DeviceStore::new(&settings);

        let (device, created) = store.get_or_create("a", Some("Van A"), 1);
        assert!(created);
        assert_eq!((device.color.as_str(), device.name.as_str()), ("red", "Van A"));

        let (device, _) = store.get_or_create("b", None, 1);
        assert_eq!((device.color.as_str(), device.name.as_str()), ("blue", "Device 2"));

        let (device, _) = store.get_or_create("c", Some(""), 1);
        assert_eq!((device.color.as_str(), device.name.as_str()), ("red", "Device 3"));

        let (device, created) = store.get_or_create("a", Some("Renamed"), 2);
        assert!(!created);
        assert_eq!((device.color.as_str(), device.name.as_str()), ("red", "Van A"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn time_gap_starts_new_segment() {
        let mut store = store();
        assert!(!store.upsert_position("A", point(10.0, 20.0), 1_000, 1_000));
        assert!(store.upsert_position("A", point(10.0, 21.0), 35_000, 35_000));
        // exactly the threshold is not a gap
        assert!(!store.upsert_position("A", point(10.0, 22.0), 65_000, 65_000));

        let positions = &store.get("A").unwrap().positions;
        assert_eq!(positions.len(), 3);
        assert!(!positions[0].is_new_segment);
        assert!(positions[1].is_new_segment);
        assert!(!positions[2].is_new_segment);
    }

    #[test]
    fn out_of_order_samples_are_not_gaps() {
        let mut store = store();
        store.upsert_position("A", point(1.0, 1.0), 100_000, 0);
        assert!(!store.upsert_position("A", point(1.0, 1.0), 1_000, 0));
    }

    #[test]
    fn history_keeps_newest_hundred_in_order() {
        let mut store = store();
        for i in 0..101u64 {
            store.upsert_position("D", point(i as f64, 0.0), i * 1_000, i * 1_000);
        }

        let positions = &store.get("D").unwrap().positions;
        assert_eq!(positions.len(), 100);
        assert_eq!(positions.front().unwrap().timestamp, 1_000);
        assert_eq!(positions.back().unwrap().timestamp, 100_000);
        assert!(
            positions
                .iter()
                .zip(positions.iter().skip(1))
                .all(|(a, b)| a.timestamp < b.timestamp)
        );
    }

    #[test]
    fn origin_is_set_once() {
        let mut store = store();
        assert!(store.set_origin("A", point(1.0, 2.0), 0));
        assert!(!store.set_origin("A", point(3.0, 4.0), 0));
        assert_eq!(store.get("A").unwrap().origem, Some(point(1.0, 2.0)));
    }

    #[test]
    fn first_route_wins() {
        let mut store = store();
        let first = vec![Destination {
            lat: 1.0,
            lng: 2.0,
            endereco: Some("X".into()),
            nd: Some("N1".into()),
        }];
        let second = vec![Destination {
            lat: 9.0,
            lng: 9.0,
            endereco: None,
            nd: None,
        }];

        assert!(!store.set_destinations("B", vec![], 0));
        assert!(store.set_destinations("B", first.clone(), 0));
        assert!(!store.set_destinations("B", second, 0));
        assert_eq!(store.get("B").unwrap().destinos, first);
    }

    #[test]
    fn invoice_upsert_is_idempotent_on_nd() {
        let mut store = store();
        let patch = InvoicePatch::status("N1", "delivered");
        assert_eq!(store.upsert_invoice("C", patch.clone(), 10), Upsert::Inserted);
        assert_eq!(store.upsert_invoice("C", patch, 20), Upsert::Updated);

        let nfs = &store.get("C").unwrap().nfs;
        assert_eq!(nfs.len(), 1);
        assert_eq!(nfs[0].status, "delivered");
        assert_eq!(nfs[0].timestamp, 10);
    }

    #[test]
    fn invoice_merge_preserves_unspecified_fields() {
        let mut store = store();
        let mut full = InvoicePatch::status("N1", "pending");
        full.nfe = Some(json!("3519"));
        full.destinatario = Some(json!("Loja Centro"));
        full.extra.insert("volumes".into(), json!(2));
        store.upsert_invoice("C", full, 10);

        let mut update = InvoicePatch::status("N1", "entregue");
        update.timestamp = Some(50);
        update.location = Some(json!({"lat": 1, "lng": 2}));
        store.upsert_invoice("C", update, 60);

        let nf = store.get("C").unwrap().invoice("N1").unwrap();
        assert_eq!(nf.status, "entregue");
        assert_eq!(nf.nfe, Some(json!("3519")));
        assert_eq!(nf.destinatario, Some(json!("Loja Centro")));
        assert_eq!(nf.location, Some(json!({"lat": 1, "lng": 2})));
        assert_eq!(nf.extra.get("volumes"), Some(&json!(2)));
        assert_eq!(nf.timestamp, 50);
    }

    #[test]
    fn new_invoice_defaults_to_pending() {
        let mut store = store();
        let patch = InvoicePatch {
            nd: "N9".into(),
            ..Default::default()
        };
        store.upsert_invoice("C", patch, 77);
        let nf = store.get("C").unwrap().invoice("N9").unwrap();
        assert_eq!((nf.status.as_str(), nf.timestamp), ("pending", 77));
    }

    #[test]
    fn remaining_destinations_skip_fulfilled_invoices() {
        let mut store = store();
        let destination = |nd: Option<&str>| Destination {
            lat: 0.0,
            lng: 0.0,
            endereco: None,
            nd: nd.map(Into::into),
        };
        store.set_destinations(
            "C",
            vec![destination(Some("N1")), destination(Some("N2")), destination(None)],
            0,
        );
        store.upsert_invoice("C", InvoicePatch::status("N1", "concluída"), 0);
        store.upsert_invoice("C", InvoicePatch::status("N2", "pending"), 0);

        let remaining = store.get("C").unwrap().remaining_destinations();
        assert_eq!(remaining, vec![&destination(Some("N2")), &destination(None)]);
    }

    #[test]
    fn mutations_stamp_last_update() {
        let mut store = store();
        store.get_or_create("A", None, 5);
        store.record_delivery(
            "A",
            Delivery {
                nd: "N1".into(),
                status: "delivered".into(),
                location: None,
                timestamp: 9,
                source: "test".into(),
            },
            9,
        );
        let device = store.get("A").unwrap();
        assert_eq!(device.last_update, 9);
        assert_eq!(device.entregas.len(), 1);
    }

    #[test]
    fn route_records_are_removed_with_devices() {
        let mut store = store();
        store.get_or_create("A", None, 0);
        store.get_or_create("B", None, 0);
        store.route_mut("A").tracking_active = true;
        store.route_mut("B").total_destinos = Some(3);

        assert!(store.remove("A").is_some());
        assert!(store.route("A").is_none());
        assert!(store.route("B").is_some());

        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert!(store.route("B").is_none());
    }

    #[test]
    fn snapshot_shape() {
        let mut store = store();
        store.upsert_position("A", point(1.0, 2.0), 10, 10);
        store.route_mut("A").tracking_active = true;
        store.get_or_create("B", Some("Moto"), 11);

        let value = serde_json::to_value(store.snapshot()).unwrap();
        let devices = value["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["deviceId"], "A");
        assert_eq!(devices[0]["positions"], json!([{"lat": 1.0, "lng": 2.0, "timestamp": 10}]));
        assert_eq!(devices[0]["color"], "red");
        assert_eq!(devices[0]["lastUpdate"], 10);
        assert_eq!(devices[0]["routeData"]["trackingActive"], true);
        assert_eq!(devices[1]["name"], "Moto");
        assert_eq!(devices[1]["origem"], json!(null));
        assert_eq!(devices[1]["routeData"], json!(null));
    }
}
