//! Per-label enqueue buffers

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::persistence::NewWorkItem;

/// Items waiting for one label's next flush
#[derive(Debug)]
struct LabelBuffer {
    created_at: Instant,
    items: Vec<NewWorkItem>,
}

/// When a label buffer becomes due
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushPolicy {
    pub buffer_size: usize,
    pub lifetime: Duration,
}

/// Buffered items keyed by label
///
/// Holds no store handle; the queue drains it under its mutex and performs the
/// insert after the lock is dropped.
#[derive(Debug, Default)]
pub(crate) struct EnqueueBuffer {
    labels: BTreeMap<String, LabelBuffer>,
    buffered: bool,
}

impl EnqueueBuffer {
    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// Number of items not yet flushed
    pub fn pending(&self) -> usize {
        self.labels.values().map(|b| b.items.len()).sum()
    }

    pub fn push(&mut self, item: NewWorkItem, now: Instant) {
        self.labels
            .entry(item.label.clone())
            .or_insert_with(|| LabelBuffer {
                created_at: now,
                items: Vec::new(),
            })
            .items
            .push(item);
    }

    /// Remove and return every item of the labels that are due.
    ///
    /// A label is due when `force` is set, buffering is off, it reached the
    /// buffer size, or it is at least `lifetime` old.
    pub fn take_due(&mut self, force: bool, policy: FlushPolicy, now: Instant) -> Vec<NewWorkItem> {
        let due: Vec<String> = self
            .labels
            .iter()
            .filter(|(_, buffer)| {
                force
                    || !self.buffered
                    || buffer.items.len() >= policy.buffer_size
                    || now.saturating_duration_since(buffer.created_at) >= policy.lifetime
            })
            .map(|(label, _)| label.clone())
            .collect();

        due.iter()
            .filter_map(|label| self.labels.remove(label))
            .flat_map(|buffer| buffer.items)
            .collect()
    }

    /// Put back items whose insert failed so the next flush retries them
    pub fn restore(&mut self, items: Vec<NewWorkItem>, now: Instant) {
        for item in items {
            self.push(item, now);
        }
    }
}
