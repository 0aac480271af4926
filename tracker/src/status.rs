//! Invoice status vocabulary.

/// Statuses that mark an invoice as fulfilled. Producers use Portuguese and English
/// spellings interchangeably.
pub const FULFILLED_STATUSES: &[&str] = &[
    "delivered",
    "entregue",
    "concluido",
    "concluída",
    "finalizado",
    "completed",
];

pub const PENDING: &str = "pending";

/// The single fulfilment predicate. Route overlays and re-routing decisions must go
/// through this function.
pub fn is_fulfilled(status: &str) -> bool {
    let status = status.trim().to_lowercase();
    FULFILLED_STATUSES.contains(&status.as_str())
}
