use crate::models::{format_micros, EnrichedItem, IngestItem};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of `received_at` timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock truncated to microseconds.
///
/// Readings never go backwards within one clock instance: if the system time
/// steps back, the previous reading is returned instead.
#[derive(Debug, Default)]
pub struct SystemClock {
    last_micros: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let previous = self.last_micros.fetch_max(wall, Ordering::AcqRel);
        let micros = previous.max(wall);
        Utc.timestamp_micros(micros)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Lowercase `text` and collapse every run of non-ASCII-alphanumeric
/// characters into a single hyphen, with no hyphen at either end.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    slug
}

/// Enrich one validated item. Pure given `received_at`.
pub fn transform_item(item: IngestItem, received_at: DateTime<Utc>) -> EnrichedItem {
    let slug = slugify(&item.name);
    let name_upper = item.name.to_uppercase();
    let value_times_two = item.value * 2.0;
    let sk = format_micros(&received_at);

    EnrichedItem {
        id: item.id,
        name: item.name,
        value: item.value,
        timestamp: item.timestamp,
        metadata: item.metadata,
        slug,
        name_upper,
        value_times_two,
        received_at,
        sk,
    }
}

/// Enrich one item, stamping it with the clock's current time.
pub fn enrich(item: IngestItem, clock: &dyn Clock) -> EnrichedItem {
    transform_item(item, clock.now())
}
