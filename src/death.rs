//! Dead-letter metadata attached by the broker.

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;

/// What the broker recorded about the most recent time a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathInfo {
    /// How many times the message was dead-lettered from `queue` for `reason`.
    pub count: u64,
    /// `rejected`, `expired`, `maxlen` or `delivery_limit`.
    pub reason: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub first_death_reason: Option<String>,
}

impl DeathInfo {
    /// Reads the `x-death` header. Returns `None` for a message that was never dead-lettered.
    pub fn from_properties(properties: &BasicProperties) -> Option<Self> {
        Self::from_headers(properties.headers().as_ref()?)
    }

    pub fn from_headers(headers: &FieldTable) -> Option<Self> {
        let deaths = match headers.inner().get("x-death") {
            Some(AMQPValue::FieldArray(deaths)) => deaths,
            _ => return None,
        };

        // The broker keeps the most recent entry first.
        let latest = deaths.as_slice().iter().find_map(|entry| match entry {
            AMQPValue::FieldTable(table) => Some(table),
            _ => None,
        })?;
        let entry = latest.inner();

        let count = entry.get("count").and_then(as_count).unwrap_or(1);
        let time = entry.get("time").and_then(|value| match value {
            AMQPValue::Timestamp(secs) => DateTime::from_timestamp(*secs as i64, 0),
            _ => None,
        });

        Some(DeathInfo {
            count,
            reason: entry.get("reason").and_then(as_text),
            queue: entry.get("queue").and_then(as_text),
            exchange: entry.get("exchange").and_then(as_text),
            time,
            first_death_reason: headers.inner().get("x-first-death-reason").and_then(as_text),
        })
    }
}

fn as_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(s.to_string()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn as_count(value: &AMQPValue) -> Option<u64> {
    match value {
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(u64::from(*n)),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        _ => None,
    }
}
