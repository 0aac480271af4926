//! The broadcast hub: applies producer events to the device store and republishes
//! the consolidated state to every registered dashboard.
//!
//! The hub is synchronous. The transport serialises access behind a mutex, so each
//! event is applied to completion before the next one is looked at.

use crate::backup::{BackupMonitor, Cadence, Due};
use crate::clock::Clock;
use crate::config::{DisconnectPolicy, TrackingConfig};
use crate::metrics_defs::{
    BACKUP_ENTRIES, DEVICES, EVENTS_RECEIVED, FLUSHES, FRAMES_DROPPED, FRAMES_SENT,
    INVOICES_UPSERTED, SEGMENT_BREAKS, SNAPSHOT_DEVICES,
};
use crate::protocol::{
    BackupLogs, ClientRole, DeliveryConfirmation, DeviceNotice, DisconnectionLog, Frame, Inbound,
    InvoiceNotice, Outbound, PositionUpdate, RecalculationNeeded, RouteReceived, RoutePayload,
    StatusChange, TrackingSignal, TrackingStatus,
};
use crate::reconcile;
use crate::status;
use crate::store::{DeviceStore, Upsert};
use crate::types::{
    BackupLogEntry, ConnectionId, Delivery, DeviceId, DisconnectionLogEntry, InvoicePatch,
    Timestamp, map_link,
};
use serde_json::Value;
use shared::{counter, gauge, histogram};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Bounded queue of encoded frames for one connection.
pub type Outbox = mpsc::Sender<Frame>;

/// Which flavour of invoice status event is being applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusEvent {
    StatusChanged,
    DeliveryConfirmation,
    PanelUpdate,
    DeliveryUpdate,
}

impl StatusEvent {
    fn source(self) -> &'static str {
        match self {
            StatusEvent::StatusChanged => "nf-status-changed",
            StatusEvent::DeliveryConfirmation => "nf-baixa",
            StatusEvent::PanelUpdate => "painel-baixa-realizada",
            StatusEvent::DeliveryUpdate => "delivery-status-update",
        }
    }

    fn notice(self, notice: InvoiceNotice<'_>) -> Outbound<'_> {
        match self {
            StatusEvent::StatusChanged => Outbound::NfStatusUpdate(notice),
            StatusEvent::DeliveryConfirmation => Outbound::NfBaixaNotification(notice),
            StatusEvent::PanelUpdate => Outbound::PainelAtualizacaoImediata(notice),
            StatusEvent::DeliveryUpdate => Outbound::DeliveryNotification(notice),
        }
    }
}

pub struct Hub {
    settings: TrackingConfig,
    policy: DisconnectPolicy,
    clock: Arc<dyn Clock>,
    store: DeviceStore,
    backups: BackupMonitor,
    connections: HashMap<ConnectionId, Outbox>,
    web_clients: HashSet<ConnectionId>,
    mobile_clients: HashSet<ConnectionId>,
    // Producer connection that last reported each device.
    owners: HashMap<DeviceId, ConnectionId>,
}

impl Hub {
    pub fn new(settings: TrackingConfig, policy: DisconnectPolicy, clock: Arc<dyn Clock>) -> Self {
        Hub {
            store: DeviceStore::new(&settings),
            backups: BackupMonitor::new(&settings),
            settings,
            policy,
            clock,
            connections: HashMap::new(),
            web_clients: HashSet::new(),
            mobile_clients: HashSet::new(),
            owners: HashMap::new(),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn backups(&self) -> &BackupMonitor {
        &self.backups
    }

    pub fn web_client_count(&self) -> usize {
        self.web_clients.len()
    }

    pub fn mobile_client_count(&self) -> usize {
        self.mobile_clients.len()
    }

    /// Registers a connection that has not declared its role yet and returns the
    /// receiving end of its outbox. It receives nothing until it identifies as a web
    /// dashboard.
    pub fn connect(&mut self, conn: &str) -> mpsc::Receiver<Frame> {
        let (outbox, frames) = mpsc::channel(self.settings.outbox_capacity.max(1));
        tracing::info!(conn, "Client connected");
        self.connections.insert(conn.to_string(), outbox);
        frames
    }

    pub fn handle(&mut self, conn: &str, event: Inbound) {
        counter!(EVENTS_RECEIVED).increment(1);
        tracing::debug!(conn, event = event.name(), "Event received");

        match event {
            Inbound::ClientType(role) => self.register(conn, role),
            Inbound::PosicaoAtual(update) => self.on_position(conn, update),
            Inbound::RouteData(payload) => self.on_route_data(conn, payload),
            Inbound::TrackingStarted(signal) => self.on_tracking_started(conn, signal),
            Inbound::TrackingStopped(signal) => self.on_tracking_stopped(conn, signal),
            Inbound::NfStatusChanged(change) => {
                self.apply_invoice_status(conn, change, StatusEvent::StatusChanged)
            }
            Inbound::NfBaixa(change) => {
                self.apply_invoice_status(conn, change, StatusEvent::DeliveryConfirmation)
            }
            Inbound::PainelBaixaRealizada(change) => {
                self.apply_invoice_status(conn, change, StatusEvent::PanelUpdate)
            }
            Inbound::DeliveryStatusUpdate(change) => {
                self.apply_invoice_status(conn, change, StatusEvent::DeliveryUpdate)
            }
            Inbound::RouteProgressUpdate(payload) => {
                self.broadcast(&Outbound::RouteUpdate(&payload))
            }
        }
    }

    fn register(&mut self, conn: &str, role: ClientRole) {
        self.web_clients.remove(conn);
        self.mobile_clients.remove(conn);

        match role {
            ClientRole::Web => {
                self.web_clients.insert(conn.to_string());
                tracing::info!(conn, "Web client registered");
                self.send_initial_state(conn);
            }
            ClientRole::Mobile => {
                self.mobile_clients.insert(conn.to_string());
                tracing::info!(conn, "Mobile client registered");
            }
        }
    }

    // Late joiners get the full state right away instead of waiting for the next
    // mutation.
    fn send_initial_state(&self, conn: &str) {
        if let Some(frame) = encode(&Outbound::AllDevicesData(self.store.snapshot())) {
            self.send(conn, &frame);
        }
        for (device_id, logs) in self.backups.all_logs() {
            let event = Outbound::BackupLogs(BackupLogs { device_id, logs });
            if let Some(frame) = encode(&event) {
                self.send(conn, &frame);
            }
        }
    }

    fn resolve_device_id(conn: &str, device_id: Option<String>) -> DeviceId {
        device_id.unwrap_or_else(|| conn.to_string())
    }

    /// Creates the device if needed, announcing new devices to dashboards. When `conn`
    /// is a registered mobile producer it becomes the owner of the device.
    fn touch_device(&mut self, conn: &str, device_id: &str, name: Option<&str>) {
        let now = self.clock.now_ms();
        let (device, created) = self.store.get_or_create(device_id, name, now);
        if created {
            let frame = encode(&Outbound::DeviceConnected(DeviceNotice {
                device_id,
                device_name: &device.name,
                color: Some(&device.color),
                timestamp: now,
            }));
            if let Some(frame) = frame {
                self.broadcast_frame(&frame);
            }
            gauge!(DEVICES).set(self.store.len() as f64);
        }
        if self.mobile_clients.contains(conn) {
            self.owners.insert(device_id.to_string(), conn.to_string());
        }
    }

    fn on_position(&mut self, conn: &str, update: PositionUpdate) {
        let device_id = Self::resolve_device_id(conn, update.device_id);
        self.touch_device(conn, &device_id, update.device_name.as_deref());

        let now = self.clock.now_ms();
        let silence = self
            .store
            .get(&device_id)
            .map(|device| now.saturating_sub(device.last_update))
            .unwrap_or_default();

        if let Some(raw) = &update.origem {
            match reconcile::parse_point(raw) {
                Some(origin) => {
                    self.store.set_origin(&device_id, origin, now);
                }
                None => tracing::warn!(device_id, payload = %raw, "Discarding malformed origin"),
            }
        }

        if let Some(raw) = update.destinos.as_ref().or(update.destino.as_ref()) {
            let destinations = reconcile::normalize_destinations(raw);
            self.store.set_destinations(&device_id, destinations, now);
        }

        if let Some(raw) = &update.coords {
            match reconcile::parse_point(raw) {
                Some(point) => {
                    let timestamp = update.timestamp.unwrap_or(now);
                    if self.store.upsert_position(&device_id, point, timestamp, now) {
                        counter!(SEGMENT_BREAKS).increment(1);
                    }
                    self.watch_position(&device_id, silence, now);
                }
                None => tracing::warn!(device_id, payload = %raw, "Discarding malformed coords"),
            }
        }

        self.store.get_or_create(&device_id, None, now).0.last_update = now;
        self.broadcast_snapshot();
    }

    // Starts monitoring on the first position and restarts the normal cadence when
    // the device comes back after a long silence.
    fn watch_position(&mut self, device_id: &str, silence: u64, now: Timestamp) {
        if self.backups.cadence(device_id).is_none() {
            self.backups.start_normal(device_id, now);
        } else if silence > self.settings.offline_return_ms {
            tracing::info!(
                device_id,
                silence_ms = silence,
                "Device back online, restarting normal backups"
            );
            self.backups.start_normal(device_id, now);
        }
    }

    fn apply_route(
        &mut self,
        device_id: &str,
        payload: &RoutePayload,
        now: Timestamp,
    ) -> (u64, usize) {
        let destinations = payload
            .destinos
            .as_ref()
            .map(reconcile::normalize_destinations)
            .unwrap_or_default();
        let destination_count = destinations.len() as u64;
        self.store.set_destinations(device_id, destinations, now);

        let invoices = payload
            .nfs
            .as_ref()
            .map(reconcile::parse_invoices)
            .unwrap_or_default();
        let invoice_count = invoices.len();
        for invoice in invoices {
            self.store.upsert_invoice(device_id, invoice, now);
            counter!(INVOICES_UPSERTED).increment(1);
        }

        let total_destinos = payload.total_destinos.unwrap_or(destination_count);
        let route = self.store.route_mut(device_id);
        if payload.rota.is_some() {
            route.rota = payload.rota.clone();
        }
        route.total_destinos = Some(total_destinos);
        route.received_at = Some(now);

        (total_destinos, invoice_count)
    }

    fn on_route_data(&mut self, conn: &str, payload: RoutePayload) {
        let device_id = Self::resolve_device_id(conn, payload.device_id.clone());
        self.touch_device(conn, &device_id, None);

        let now = self.clock.now_ms();
        let (total_destinos, nfs_count) = self.apply_route(&device_id, &payload, now);
        tracing::info!(device_id, total_destinos, nfs_count, "Route received");

        self.broadcast(&Outbound::RouteReceived(RouteReceived {
            device_id: &device_id,
            total_destinos,
            nfs_count,
            timestamp: now,
        }));
        self.broadcast_snapshot();
    }

    fn on_tracking_started(&mut self, conn: &str, signal: TrackingSignal) {
        let device_id = Self::resolve_device_id(conn, signal.device_id);
        self.touch_device(conn, &device_id, signal.device_name.as_deref());

        let now = self.clock.now_ms();
        if let Some(payload) = &signal.route_data {
            self.apply_route(&device_id, payload, now);
        }
        let route = self.store.route_mut(&device_id);
        route.tracking_active = true;
        route.started_at = Some(now);
        self.backups.start_normal(&device_id, now);

        tracing::info!(device_id, "Tracking started");
        self.broadcast_tracking_status(&device_id, "started", now);
        self.broadcast_snapshot();
    }

    fn on_tracking_stopped(&mut self, conn: &str, signal: TrackingSignal) {
        let device_id = Self::resolve_device_id(conn, signal.device_id);
        self.touch_device(conn, &device_id, signal.device_name.as_deref());

        let now = self.clock.now_ms();
        let route = self.store.route_mut(&device_id);
        route.tracking_active = false;
        route.stopped_at = Some(now);
        self.backups.cancel(&device_id);

        tracing::info!(device_id, "Tracking stopped");
        self.broadcast_tracking_status(&device_id, "stopped", now);
        self.broadcast_snapshot();
    }

    fn broadcast_tracking_status(&self, device_id: &str, status: &'static str, now: Timestamp) {
        let device_name = self
            .store
            .get(device_id)
            .map(|device| device.name.as_str())
            .unwrap_or_default();
        self.broadcast(&Outbound::TrackingStatus(TrackingStatus {
            device_id,
            device_name,
            status,
            timestamp: now,
        }));
    }

    /// The single path for every invoice status event.
    fn apply_invoice_status(&mut self, conn: &str, change: StatusChange, kind: StatusEvent) {
        let Some(nd) = change.nd else {
            tracing::warn!(conn, source = kind.source(), "Discarding status change without nd");
            return;
        };
        let device_id = Self::resolve_device_id(conn, change.device_id);
        self.touch_device(conn, &device_id, None);

        let now = self.clock.now_ms();
        let timestamp = change.timestamp.unwrap_or(now);
        let patch = InvoicePatch {
            nd: nd.clone(),
            status: change.status,
            status_code: change.status_code,
            location: change.location.clone(),
            timestamp: Some(timestamp),
            ..Default::default()
        };
        let outcome = self.store.upsert_invoice(&device_id, patch, now);
        counter!(INVOICES_UPSERTED).increment(1);

        let Some(invoice) = self
            .store
            .get(&device_id)
            .and_then(|device| device.invoice(&nd))
        else {
            return;
        };
        let status = invoice.status.clone();
        let status_code = invoice.status_code.clone();

        self.store.record_delivery(
            &device_id,
            Delivery {
                nd: nd.clone(),
                status: status.clone(),
                location: change.location.clone(),
                timestamp,
                source: change.source.unwrap_or_else(|| kind.source().to_string()),
            },
            now,
        );
        tracing::info!(
            device_id,
            nd,
            status,
            inserted = outcome == Upsert::Inserted,
            "Invoice status applied"
        );

        self.broadcast(&kind.notice(InvoiceNotice {
            device_id: &device_id,
            nd: &nd,
            status: &status,
            status_code: status_code.as_ref(),
            location: change.location.as_ref(),
            timestamp,
        }));

        if kind == StatusEvent::DeliveryConfirmation {
            let confirmation = Outbound::NfBaixaConfirmation(DeliveryConfirmation {
                device_id: &device_id,
                nd: &nd,
                status: &status,
                success: true,
                timestamp: now,
            });
            if let Some(frame) = encode(&confirmation) {
                self.send(conn, &frame);
            }
        }

        if status::is_fulfilled(&status)
            && let Some(device) = self.store.get(&device_id)
        {
            self.broadcast(&Outbound::RouteRecalculationNeeded(RecalculationNeeded {
                device_id: &device_id,
                nd: &nd,
                status: &status,
                remaining_destinos: device.remaining_destinations(),
            }));
        }

        self.broadcast_snapshot();
    }

    pub fn disconnect(&mut self, conn: &str) {
        self.connections.remove(conn);

        if self.web_clients.remove(conn) {
            tracing::info!(conn, "Web client disconnected");
            return;
        }
        if !self.mobile_clients.remove(conn) {
            tracing::info!(conn, "Unclassified client disconnected");
            return;
        }

        let affected: Vec<DeviceId> = match self.policy {
            DisconnectPolicy::FlushAll => self.store.ids().cloned().collect(),
            DisconnectPolicy::OwnDevices | DisconnectPolicy::Retain => self
                .owners
                .iter()
                .filter(|(_, owner)| owner.as_str() == conn)
                .map(|(device_id, _)| device_id.clone())
                .collect(),
        };
        tracing::info!(
            conn,
            policy = ?self.policy,
            devices = affected.len(),
            "Mobile client disconnected"
        );

        let now = self.clock.now_ms();
        let logs: Vec<DisconnectionLogEntry> = affected
            .iter()
            .filter_map(|device_id| {
                let device = self.store.get(device_id)?;
                Some(DisconnectionLogEntry {
                    device_id: device_id.clone(),
                    device_name: device.name.clone(),
                    last_position: device.last_position()?.clone(),
                    timestamp: now,
                })
            })
            .collect();

        let removed = match self.policy {
            DisconnectPolicy::FlushAll => {
                self.flush_all();
                true
            }
            DisconnectPolicy::OwnDevices => {
                for device_id in &affected {
                    self.remove_device(device_id);
                }
                !affected.is_empty()
            }
            DisconnectPolicy::Retain => {
                let at = now + self.settings.offline_check_delay_ms;
                for device_id in &affected {
                    self.backups.schedule_offline_check(device_id, at);
                }
                false
            }
        };

        for entry in &logs {
            self.broadcast(&Outbound::DeviceDisconnected(entry));
        }
        if !logs.is_empty() {
            self.broadcast(&Outbound::DeviceDisconnectionLog(DisconnectionLog { logs: &logs }));
        }
        if removed {
            counter!(FLUSHES).increment(1);
            self.broadcast_snapshot();
        }
    }

    /// Removes one device with its route record, timers, logs and ownership.
    pub fn remove_device(&mut self, device_id: &str) {
        self.store.remove(device_id);
        self.backups.remove(device_id);
        self.owners.remove(device_id);
        gauge!(DEVICES).set(self.store.len() as f64);
    }

    /// Drops every device, route record and backup timer.
    pub fn flush_all(&mut self) {
        let removed = self.store.clear();
        self.backups.clear();
        self.owners.clear();
        gauge!(DEVICES).set(0.0);
        tracing::info!(removed, "Device state flushed");
    }

    /// Runs every backup and offline check that is due. Called by the sweep task.
    pub fn run_due(&mut self) {
        let now = self.clock.now_ms();
        for due in self.backups.take_due(now) {
            match due {
                Due::Backup { device_id, cadence } => self.take_backup(&device_id, cadence, now),
                Due::OfflineCheck { device_id } => self.check_offline(&device_id, now),
            }
        }
    }

    fn take_backup(&mut self, device_id: &str, cadence: Cadence, now: Timestamp) {
        let Some(device) = self.store.get(device_id) else {
            tracing::debug!(device_id, "Backup timer outlived its device");
            self.backups.cancel(device_id);
            return;
        };
        let Some(position) = device.last_position() else {
            return;
        };

        let entry = BackupLogEntry {
            timestamp: now,
            position: position.point(),
            link: map_link(position.point()),
            is_offline: cadence.is_offline(),
            device_name: device.name.clone(),
        };
        let logs = self.backups.record(device_id, entry);
        counter!(BACKUP_ENTRIES).increment(1);

        let event = Outbound::BackupLogs(BackupLogs { device_id, logs });
        if let Some(frame) = encode(&event) {
            self.broadcast_frame(&frame);
        }
    }

    fn check_offline(&mut self, device_id: &str, now: Timestamp) {
        let Some(device) = self.store.get(device_id) else {
            return;
        };
        let silence = now.saturating_sub(device.last_update);
        if silence > self.settings.offline_check_delay_ms {
            tracing::info!(device_id, silence_ms = silence, "Device presumed offline");
            self.backups.start_offline(device_id, now);
        }
    }

    /// Cancels every timer. The hub keeps serving events afterwards, but nothing is
    /// scheduled until a device is started again.
    pub fn shutdown(&mut self) {
        tracing::info!(timers = self.backups.active_timers(), "Cancelling backup timers");
        self.backups.cancel_all();
    }

    /// The current `all-devices-data` payload.
    pub fn snapshot_json(&self) -> Value {
        serde_json::to_value(self.store.snapshot()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialise snapshot");
            Value::Null
        })
    }

    fn broadcast_snapshot(&self) {
        histogram!(SNAPSHOT_DEVICES).record(self.store.len() as f64);
        self.broadcast(&Outbound::AllDevicesData(self.store.snapshot()));
    }

    fn broadcast(&self, event: &Outbound<'_>) {
        if let Some(frame) = encode(event) {
            self.broadcast_frame(&frame);
        }
    }

    fn broadcast_frame(&self, frame: &Frame) {
        for conn in &self.web_clients {
            self.send(conn, frame);
        }
    }

    // Best effort: frames for a consumer that went away or stopped reading are dropped,
    // the next mutation pushes the whole state again anyway.
    fn send(&self, conn: &str, frame: &Frame) {
        let Some(outbox) = self.connections.get(conn) else {
            counter!(FRAMES_DROPPED).increment(1);
            tracing::debug!(conn, "Dropping frame for unknown client");
            return;
        };
        match outbox.try_send(frame.clone()) {
            Ok(()) => counter!(FRAMES_SENT).increment(1),
            Err(TrySendError::Full(_)) => {
                counter!(FRAMES_DROPPED).increment(1);
                tracing::debug!(conn, "Dropping frame for slow client");
            }
            Err(TrySendError::Closed(_)) => {
                counter!(FRAMES_DROPPED).increment(1);
                tracing::debug!(conn, "Dropping frame for closed client");
            }
        }
    }
}

fn encode(event: &Outbound<'_>) -> Option<Frame> {
    event
        .encode()
        .inspect_err(|e| tracing::error!(error = %e, "Failed to encode outbound event"))
        .ok()
}
