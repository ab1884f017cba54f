//! Event log for tracking beacon activity.
//! Ring buffer of recent scheduler events, served at `/events`.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

const MAX_EVENTS: usize = 200;

/// Types of events the scheduler can emit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BeaconEvent {
    #[serde(rename = "chain_started")]
    ChainStarted {
        timestamp: u64,
        chain_index: u64,
        certificate_id: String,
    },
    #[serde(rename = "pulse_released")]
    PulseReleased {
        timestamp: u64,
        chain_index: u64,
        pulse_index: u64,
        output_value: String,
        status_code: u32,
        generation_ms: i64,
        tuning_slack_ms: i64,
        time_accuracy_ms: i64,
    },
    #[serde(rename = "pulse_late")]
    PulseLate {
        timestamp: u64,
        chain_index: u64,
        pulse_index: u64,
        late_by_ms: i64,
    },
}

impl BeaconEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            BeaconEvent::ChainStarted { timestamp, .. } => *timestamp,
            BeaconEvent::PulseReleased { timestamp, .. } => *timestamp,
            BeaconEvent::PulseLate { timestamp, .. } => *timestamp,
        }
    }
}

/// Current wall-clock time in milliseconds, the event timestamp unit.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Thread-safe event log with ring buffer
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<VecDeque<BeaconEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_EVENTS))),
        }
    }

    /// Push an event to the log
    pub async fn push(&self, event: BeaconEvent) {
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Get the latest N events (newest first)
    pub async fn latest(&self, limit: usize) -> Vec<BeaconEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    /// Get events since a given timestamp
    pub async fn since(&self, timestamp: u64) -> Vec<BeaconEvent> {
        let events = self.events.read().await;
        events.iter()
            .filter(|e| e.timestamp() > timestamp)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn late(timestamp: u64, pulse_index: u64) -> BeaconEvent {
        BeaconEvent::PulseLate { timestamp, chain_index: 0, pulse_index, late_by_ms: 5 }
    }

    #[tokio::test]
    async fn test_ring_buffer_drops_oldest() {
        let log = EventLog::new();
        for i in 0..(MAX_EVENTS as u64 + 10) {
            log.push(late(i, i)).await;
        }

        let all = log.latest(usize::MAX).await;
        assert_eq!(all.len(), MAX_EVENTS);
        assert_eq!(all[0].timestamp(), MAX_EVENTS as u64 + 9);
        assert_eq!(all.last().map(|e| e.timestamp()), Some(10));
    }

    #[tokio::test]
    async fn test_since_and_json_tag() {
        let log = EventLog::new();
        log.push(late(100, 1)).await;
        log.push(late(200, 2)).await;

        let recent = log.since(150).await;
        assert_eq!(recent.len(), 1);

        let json = serde_json::to_value(&recent[0]).unwrap();
        assert_eq!(json["type"], "pulse_late");
        assert_eq!(json["pulse_index"], 2);
    }
}
