//! Metrics definitions for the tracker.

use shared::metrics_defs::{MetricDef, MetricType};

pub const EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "events.received",
    metric_type: MetricType::Counter,
    description: "Number of inbound events decoded from producers and dashboards",
};

pub const EVENTS_REJECTED: MetricDef = MetricDef {
    name: "events.rejected",
    metric_type: MetricType::Counter,
    description: "Number of inbound frames that could not be decoded",
};

pub const FRAMES_SENT: MetricDef = MetricDef {
    name: "frames.sent",
    metric_type: MetricType::Counter,
    description: "Number of frames queued to connected clients",
};

pub const FRAMES_DROPPED: MetricDef = MetricDef {
    name: "frames.dropped",
    metric_type: MetricType::Counter,
    description: "Number of frames dropped because the client was gone",
};

pub const SNAPSHOT_DEVICES: MetricDef = MetricDef {
    name: "snapshot.devices",
    metric_type: MetricType::Histogram,
    description: "Number of devices in each broadcast snapshot",
};

pub const DEVICES: MetricDef = MetricDef {
    name: "devices",
    metric_type: MetricType::Gauge,
    description: "Number of devices currently tracked",
};

pub const SEGMENT_BREAKS: MetricDef = MetricDef {
    name: "positions.segment_breaks",
    metric_type: MetricType::Counter,
    description: "Number of positions that started a new segment after a time gap",
};

pub const DESTINATIONS_DISCARDED: MetricDef = MetricDef {
    name: "destinations.discarded",
    metric_type: MetricType::Counter,
    description: "Number of destination entries with an unrecognised shape",
};

pub const INVOICES_DISCARDED: MetricDef = MetricDef {
    name: "invoices.discarded",
    metric_type: MetricType::Counter,
    description: "Number of invoice entries without a usable nd",
};

pub const INVOICES_UPSERTED: MetricDef = MetricDef {
    name: "invoices.upserted",
    metric_type: MetricType::Counter,
    description: "Number of invoice inserts and updates",
};

pub const BACKUP_ENTRIES: MetricDef = MetricDef {
    name: "backup.entries",
    metric_type: MetricType::Counter,
    description: "Number of backup log entries recorded",
};

pub const FLUSHES: MetricDef = MetricDef {
    name: "devices.flushes",
    metric_type: MetricType::Counter,
    description: "Number of producer disconnects that removed device state",
};

pub const ALL_METRICS: &[MetricDef] = &[
    EVENTS_RECEIVED,
    EVENTS_REJECTED,
    FRAMES_SENT,
    FRAMES_DROPPED,
    SNAPSHOT_DEVICES,
    DEVICES,
    SEGMENT_BREAKS,
    DESTINATIONS_DISCARDED,
    INVOICES_DISCARDED,
    INVOICES_UPSERTED,
    BACKUP_ENTRIES,
    FLUSHES,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_unique() {
        assert_eq!(shared::metrics_defs::find_duplicate(ALL_METRICS), None);
    }
}
