//! Per-handler statistics.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Immutable snapshot of one handler's counters, or the sum of several.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MessageHandlerStats {
    pub name: String,
    pub total_messages_processed: u64,
    pub total_messages_failed: u64,
    pub total_retries: u64,
    pub total_normal_messages_received: u64,
    pub total_priority_messages_received: u64,
    pub last_message_processed: Option<DateTime<Utc>>,
}

impl MessageHandlerStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, other: &MessageHandlerStats) {
        self.total_messages_processed += other.total_messages_processed;
        self.total_messages_failed += other.total_messages_failed;
        self.total_retries += other.total_retries;
        self.total_normal_messages_received += other.total_normal_messages_received;
        self.total_priority_messages_received += other.total_priority_messages_received;
        self.last_message_processed = match (self.last_message_processed, other.last_message_processed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Sums any number of snapshots under a new name.
    pub fn combine<'a, I>(name: impl Into<String>, stats: I) -> Self
    where
        I: IntoIterator<Item = &'a MessageHandlerStats>,
    {
        stats.into_iter().fold(Self::new(name), |mut total, s| {
            total.add(s);
            total
        })
    }

    pub fn total_messages_received(&self) -> u64 {
        self.total_normal_messages_received + self.total_priority_messages_received
    }
}

impl fmt::Display for MessageHandlerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATS for {}:", self.name)?;
        writeln!(f)?;
        writeln!(f, "  TotalNormalMessagesReceived:    {}", self.total_normal_messages_received)?;
        writeln!(f, "  TotalPriorityMessagesReceived:  {}", self.total_priority_messages_received)?;
        writeln!(f, "  TotalProcessed:                 {}", self.total_messages_processed)?;
        writeln!(f, "  TotalRetries:                   {}", self.total_retries)?;
        writeln!(f, "  TotalFailed:                    {}", self.total_messages_failed)?;
        match self.last_message_processed {
            Some(at) => writeln!(f, "  LastMessageProcessed:           {}", at.to_rfc3339()),
            None => writeln!(f, "  LastMessageProcessed:           never"),
        }
    }
}

/// Live counters written by the owning handler and read from any thread.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    normal_received: AtomicU64,
    priority_received: AtomicU64,
    // Unix millis; zero means never.
    last_processed_ms: AtomicI64,
}

impl StatsCounters {
    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, priority: bool) {
        if priority {
            self.priority_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.normal_received.fetch_add(1, Ordering::Relaxed);
        }
        self.last_processed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// Cloneable read handle onto a handler's counters.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    name: String,
    counters: Arc<StatsCounters>,
}

impl StatsHandle {
    pub(crate) fn new(name: impl Into<String>, counters: Arc<StatsCounters>) -> Self {
        Self {
            name: name.into(),
            counters,
        }
    }

    pub fn snapshot(&self) -> MessageHandlerStats {
        let c = &self.counters;
        let last_ms = c.last_processed_ms.load(Ordering::Relaxed);
        MessageHandlerStats {
            name: self.name.clone(),
            total_messages_processed: c.processed.load(Ordering::Relaxed),
            total_messages_failed: c.failed.load(Ordering::Relaxed),
            total_retries: c.retries.load(Ordering::Relaxed),
            total_normal_messages_received: c.normal_received.load(Ordering::Relaxed),
            total_priority_messages_received: c.priority_received.load(Ordering::Relaxed),
            last_message_processed: if last_ms == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last_ms)
            },
        }
    }
}
