//! Transient pull request and review notifications shown on the bar row.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::NotificationConfig,
    device_config::Repository,
    matrix::{Color, MatrixDimensions, PixelBuffer, palette},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PrOpened,
    PrMerged,
    PrClosed,
    ReviewComment,
}

impl EventKind {
    /// Display priority; higher is shown first.
    pub const fn priority(self) -> u8 {
        match self {
            EventKind::PrMerged => 4,
            EventKind::PrOpened => 3,
            EventKind::PrClosed => 2,
            EventKind::ReviewComment => 1,
        }
    }

    pub const fn color(self) -> Color {
        match self {
            EventKind::PrOpened => palette::PR_OPENED,
            EventKind::PrMerged => palette::PR_MERGED,
            EventKind::PrClosed => palette::PR_CLOSED,
            EventKind::ReviewComment => palette::REVIEW_COMMENT,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::PrOpened => "opened",
            EventKind::PrMerged => "merged",
            EventKind::PrClosed => "closed",
            EventKind::ReviewComment => "review comment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub repository: Repository,
    /// Pull request number or comment id.
    pub number: u64,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub ttl: Duration,
}

impl NotificationEvent {
    pub fn new(
        kind: EventKind,
        repository: Repository,
        number: u64,
        timestamp: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            kind,
            repository,
            number,
            timestamp,
            priority: kind.priority(),
            ttl,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp.checked_add_signed(self.ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    fn sort_key(&self) -> (u8, DateTime<Utc>) {
        (self.priority, self.timestamp)
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {}", self.repository, self.number, self.kind)
    }
}

/// Bounded queue ordered by priority, then recency.
#[derive(Debug, Clone)]
pub struct NotificationBar {
    events: Vec<NotificationEvent>,
    capacity: usize,
    visible: usize,
    blink: Duration,
    width: usize,
}

impl NotificationBar {
    pub fn new(config: &NotificationConfig, width: usize) -> Self {
        Self {
            events: Vec::with_capacity(config.capacity + 1),
            capacity: config.capacity.max(1),
            visible: config.visible.max(1),
            blink: crate::config::seconds(config.blink_secs),
            width,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Live events, front first.
    pub fn events(&self) -> &[NotificationEvent] {
        &self.events
    }

    /// Inserts `event` in order. When the queue overflows the last entry is
    /// evicted and returned; that can be `event` itself.
    pub fn push(&mut self, event: NotificationEvent) -> Option<NotificationEvent> {
        let key = event.sort_key();
        let index = self.events.partition_point(|e| e.sort_key() >= key);
        self.events.insert(index, event);

        if self.events.len() > self.capacity {
            self.events.pop()
        } else {
            None
        }
    }

    /// Drops expired events and returns how many were removed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| !e.is_expired(now));
        before - self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Expires old events, then draws up to `visible` events as equal blocks,
    /// highest priority leftmost. Recent events blink on odd seconds.
    pub fn render(&mut self, now: DateTime<Utc>) -> PixelBuffer {
        self.expire(now);

        let mut buffer = PixelBuffer::filled(MatrixDimensions::new(self.width, 1), palette::BACKGROUND);
        let shown = self.events.len().min(self.visible);
        if shown == 0 {
            return buffer;
        }

        let block = self.width / shown;
        let odd_second = now.timestamp().rem_euclid(2) == 1;

        for (slot, event) in self.events.iter().take(shown).enumerate() {
            let blinking = now - event.timestamp < self.blink;
            let color = if blinking && odd_second {
                palette::BACKGROUND
            } else {
                event.kind.color()
            };
            for x in slot * block..(slot + 1) * block {
                buffer.set(x, 0, color);
            }
        }
        buffer
    }
}
