//! Periodic backup snapshots of each device's last known position.
//!
//! Every device has at most one recurring timer. Timers are entries in a side table
//! polled by a single sweep task rather than one runtime timer per device, so
//! cancelling a timer is removing its entry.

use crate::config::TrackingConfig;
use crate::types::{BackupLogEntry, DeviceId, Timestamp};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cadence {
    Normal,
    Offline,
}

impl Cadence {
    pub fn is_offline(self) -> bool {
        self == Cadence::Offline
    }
}

#[derive(Debug)]
struct Timer {
    cadence: Cadence,
    next_due: Timestamp,
}

/// Work that became due during a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Due {
    Backup { device_id: DeviceId, cadence: Cadence },
    OfflineCheck { device_id: DeviceId },
}

pub struct BackupMonitor {
    timers: HashMap<DeviceId, Timer>,
    offline_checks: HashMap<DeviceId, Timestamp>,
    logs: HashMap<DeviceId, VecDeque<BackupLogEntry>>,
    normal_interval_ms: u64,
    offline_interval_ms: u64,
    max_logs: usize,
}

impl BackupMonitor {
    pub fn new(settings: &TrackingConfig) -> Self {
        BackupMonitor {
            timers: HashMap::new(),
            offline_checks: HashMap::new(),
            logs: HashMap::new(),
            normal_interval_ms: settings.normal_backup_interval_ms,
            offline_interval_ms: settings.offline_backup_interval_ms,
            max_logs: settings.max_backup_logs,
        }
    }

    fn interval(&self, cadence: Cadence) -> u64 {
        match cadence {
            Cadence::Normal => self.normal_interval_ms,
            Cadence::Offline => self.offline_interval_ms,
        }
    }

    /// Replaces any timer of `device_id` with one firing every interval of `cadence`,
    /// first one interval from `now`.
    pub fn start(&mut self, device_id: &str, cadence: Cadence, now: Timestamp) {
        let next_due = now + self.interval(cadence);
        let previous = self
            .timers
            .insert(device_id.to_string(), Timer { cadence, next_due });

        tracing::debug!(
            device_id,
            ?cadence,
            replaced = ?previous.map(|timer| timer.cadence),
            "Backup timer started"
        );
    }

    pub fn start_normal(&mut self, device_id: &str, now: Timestamp) {
        self.start(device_id, Cadence::Normal, now);
    }

    pub fn start_offline(&mut self, device_id: &str, now: Timestamp) {
        self.start(device_id, Cadence::Offline, now);
    }

    pub fn cadence(&self, device_id: &str) -> Option<Cadence> {
        self.timers.get(device_id).map(|timer| timer.cadence)
    }

    /// Cancels the timer and any pending offline check of `device_id`.
    pub fn cancel(&mut self, device_id: &str) {
        self.timers.remove(device_id);
        self.offline_checks.remove(device_id);
    }

    /// Cancels everything for `device_id` and forgets its logs.
    pub fn remove(&mut self, device_id: &str) {
        self.cancel(device_id);
        self.logs.remove(device_id);
    }

    /// Cancels every timer and check. Logs are kept.
    pub fn cancel_all(&mut self) {
        self.timers.clear();
        self.offline_checks.clear();
    }

    pub fn clear(&mut self) {
        self.cancel_all();
        self.logs.clear();
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn schedule_offline_check(&mut self, device_id: &str, at: Timestamp) {
        self.offline_checks.insert(device_id.to_string(), at);
    }

    pub fn has_offline_check(&self, device_id: &str) -> bool {
        self.offline_checks.contains_key(device_id)
    }

    /// Collects everything due at `now`, advancing recurring timers to their next
    /// slot and consuming offline checks. Results are sorted by device id.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<Due> {
        let mut due = Vec::new();

        for (device_id, timer) in self.timers.iter_mut() {
            if timer.next_due > now {
                continue;
            }
            let interval = match timer.cadence {
                Cadence::Normal => self.normal_interval_ms,
                Cadence::Offline => self.offline_interval_ms,
            };
            timer.next_due += interval;
            // A stalled sweep fires once, not once per missed slot.
            if timer.next_due <= now {
                timer.next_due = now + interval;
            }
            due.push(Due::Backup {
                device_id: device_id.clone(),
                cadence: timer.cadence,
            });
        }

        self.offline_checks.retain(|device_id, at| {
            if *at <= now {
                due.push(Due::OfflineCheck {
                    device_id: device_id.clone(),
                });
                false
            } else {
                true
            }
        });

        due.sort_by(|a, b| due_key(a).cmp(due_key(b)));
        due
    }

    /// Appends to the device's log, evicting the oldest entry beyond `max_backup_logs`.
    pub fn record(&mut self, device_id: &str, entry: BackupLogEntry) -> &VecDeque<BackupLogEntry> {
        let max_logs = self.max_logs;
        let logs = self.logs.entry(device_id.to_string()).or_default();
        logs.push_back(entry);
        while logs.len() > max_logs {
            logs.pop_front();
        }
        logs
    }

    pub fn logs(&self, device_id: &str) -> Option<&VecDeque<BackupLogEntry>> {
        self.logs.get(device_id)
    }

    pub fn all_logs(&self) -> impl Iterator<Item = (&DeviceId, &VecDeque<BackupLogEntry>)> {
        self.logs.iter().filter(|(_, logs)| !logs.is_empty())
    }
}

fn due_key(due: &Due) -> &str {
    match due {
        Due::Backup { device_id, .. } | Due::OfflineCheck { device_id } => device_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LatLng;

    const MINUTE: u64 = 60_000;

    fn monitor() -> BackupMonitor {
        BackupMonitor::new(&TrackingConfig::default())
    }

    fn entry(timestamp: Timestamp) -> BackupLogEntry {
        BackupLogEntry {
            timestamp,
            position: LatLng { lat: 0.0, lng: 0.0 },
            link: String::new(),
            is_offline: false,
            device_name: "Van".into(),
        }
    }

    #[test]
    fn normal_cadence_fires_every_ten_minutes() {
        let mut monitor = monitor();
        monitor.start_normal("A", 0);

        assert!(monitor.take_due(10 * MINUTE - 1).is_empty());
        assert_eq!(
            monitor.take_due(10 * MINUTE),
            vec![Due::Backup {
                device_id: "A".into(),
                cadence: Cadence::Normal
            }]
        );
        assert!(monitor.take_due(15 * MINUTE).is_empty());
        assert_eq!(monitor.take_due(20 * MINUTE).len(), 1);
    }

    #[test]
    fn offline_cadence_replaces_normal() {
        let mut monitor = monitor();
        monitor.start_normal("A", 0);
        monitor.start_offline("A", 0);

        assert_eq!(monitor.active_timers(), 1);
        assert_eq!(monitor.cadence("A"), Some(Cadence::Offline));
        assert_eq!(
            monitor.take_due(5 * MINUTE),
            vec![Due::Backup {
                device_id: "A".into(),
                cadence: Cadence::Offline
            }]
        );
    }

    #[test]
    fn stalled_sweep_fires_once() {
        let mut monitor = monitor();
        monitor.start_offline("A", 0);
        assert_eq!(monitor.take_due(60 * MINUTE).len(), 1);
        assert!(monitor.take_due(61 * MINUTE).is_empty());
        assert_eq!(monitor.take_due(65 * MINUTE).len(), 1);
    }

    #[test]
    fn offline_checks_fire_once() {
        let mut monitor = monitor();
        monitor.schedule_offline_check("B", 2 * MINUTE);
        monitor.start_normal("A", 0);

        assert!(monitor.take_due(MINUTE).is_empty());
        assert_eq!(
            monitor.take_due(2 * MINUTE),
            vec![Due::OfflineCheck {
                device_id: "B".into()
            }]
        );
        assert!(!monitor.has_offline_check("B"));
        assert!(monitor.take_due(3 * MINUTE).is_empty());
    }

    #[test]
    fn cancellation_removes_timer_and_check() {
        let mut monitor = monitor();
        monitor.start_normal("A", 0);
        monitor.schedule_offline_check("A", MINUTE);
        monitor.cancel("A");

        assert_eq!(monitor.cadence("A"), None);
        assert!(monitor.take_due(60 * MINUTE).is_empty());
    }

    #[test]
    fn logs_are_capped() {
        let mut monitor = monitor();
        for i in 0..60 {
            monitor.record("A", entry(i));
        }
        let logs = monitor.logs("A").unwrap();
        assert_eq!(logs.len(), 50);
        assert_eq!(logs.front().unwrap().timestamp, 10);

        monitor.remove("A");
        assert!(monitor.logs("A").is_none());
    }

    #[test]
    fn cancel_all_keeps_logs() {
        let mut monitor = monitor();
        monitor.start_normal("A", 0);
        monitor.record("A", entry(1));
        monitor.cancel_all();
        assert_eq!(monitor.active_timers(), 0);
        assert_eq!(monitor.all_logs().count(), 1);

        monitor.clear();
        assert_eq!(monitor.all_logs().count(), 0);
    }
}
