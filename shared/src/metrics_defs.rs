//! Common types for metrics definitions.
//!
//! Each service declares its metrics as `MetricDef` constants and lists them in an
//! `ALL_METRICS` table, which is registered once at startup through [`describe_all`].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "Counter",
            MetricType::Gauge => "Gauge",
            MetricType::Histogram => "Histogram",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub description: &'static str,
}

/// Registers the description of every metric with the installed recorder.
pub fn describe_all(defs: &[MetricDef]) {
    for def in defs {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}

/// Returns the first name that appears more than once in `defs`.
pub fn find_duplicate(defs: &[MetricDef]) -> Option<&'static str> {
    defs.iter().enumerate().find_map(|(i, def)| {
        defs[..i]
            .iter()
            .any(|earlier| earlier.name == def.name)
            .then_some(def.name)
    })
}

#[macro_export]
macro_rules! counter {
    ($def:expr) => {
        metrics::counter!($def.name)
    };
}

#[macro_export]
macro_rules! gauge {
    ($def:expr) => {
        metrics::gauge!($def.name)
    };
}

#[macro_export]
macro_rules! histogram {
    ($def:expr) => {
        metrics::histogram!($def.name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: MetricDef = MetricDef {
        name: "a",
        metric_type: MetricType::Counter,
        description: "a",
    };
    const B: MetricDef = MetricDef {
        name: "b",
        metric_type: MetricType::Gauge,
        description: "b",
    };

    #[test]
    fn duplicate_names_are_found() {
        assert_eq!(find_duplicate(&[A, B]), None);
        assert_eq!(find_duplicate(&[A, B, A]), Some("a"));
    }

    #[test]
    fn describing_without_recorder_is_a_noop() {
        describe_all(&[A, B]);
        assert_eq!(B.metric_type.as_str(), "Gauge");
    }
}
