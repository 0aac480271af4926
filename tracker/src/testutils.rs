use crate::clock::Clock;
use crate::hub::Hub;
use crate::protocol::Frame;
use crate::types::Timestamp;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// A clock that only moves when told to.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// The receiving end of a connection registered with a hub. Frames are decoded
/// into `{"event", "data"}` values as they are read.
pub struct TestClient {
    rx: mpsc::Receiver<Frame>,
    received: VecDeque<Value>,
}

impl TestClient {
    pub fn connect(hub: &mut Hub, conn: &str) -> Self {
        let rx = hub.connect(conn);
        TestClient {
            rx,
            received: VecDeque::new(),
        }
    }

    fn pull(&mut self) {
        while let Ok(frame) = self.rx.try_recv() {
            let value = serde_json::from_str(&frame).expect("frame is json");
            self.received.push_back(value);
        }
    }

    /// Consumes frames up to and including the first `name` event, returning its data.
    pub fn next_event(&mut self, name: &str) -> Value {
        self.pull();
        while let Some(frame) = self.received.pop_front() {
            if frame["event"] == name {
                return frame["data"].clone();
            }
        }
        panic!("no {name} event received");
    }

    /// Data of the most recent pending `name` event, without consuming anything.
    pub fn last_event(&mut self, name: &str) -> Value {
        self.events_named(name)
            .pop()
            .unwrap_or_else(|| panic!("no {name} event received"))
    }

    /// Data of every pending `name` event, without consuming anything.
    pub fn events_named(&mut self, name: &str) -> Vec<Value> {
        self.pull();
        self.received
            .iter()
            .filter(|frame| frame["event"] == name)
            .map(|frame| frame["data"].clone())
            .collect()
    }

    /// Takes every pending frame.
    pub fn drain(&mut self) -> Vec<Value> {
        self.pull();
        self.received.drain(..).collect()
    }
}
