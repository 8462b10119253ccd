//! Window types and identifiers
//!
//! Windows are half-open event-time intervals `[start, end)` in milliseconds.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::watermark::Watermark;

/// Kind of window produced by an assigner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling,
    Sliding,
    Session,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Tumbling => write!(f, "tumbling"),
            WindowKind::Sliding => write!(f, "sliding"),
            WindowKind::Session => write!(f, "session"),
        }
    }
}

/// An event-time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Start time of the window (inclusive)
    pub start: i64,
    /// End time of the window (exclusive)
    pub end: i64,
    pub kind: WindowKind,
}

impl Window {
    pub fn new(start: i64, end: i64, kind: WindowKind) -> Self {
        Self { start, end, kind }
    }

    /// Length of the window in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this window overlaps with another window
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest window covering both
    pub fn merge(&self, other: &Window) -> Window {
        Window {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            kind: self.kind,
        }
    }

    /// A window closes once the watermark reaches its end
    ///
    /// A session stays open while the watermark sits at `last + gap`, since a
    /// record at exactly that time still extends it.
    pub fn is_closed_by(&self, watermark: Watermark) -> bool {
        self.is_past(self.end, watermark)
    }

    /// Whether the watermark has moved past `deadline` under this window's closing rule
    pub fn is_past(&self, deadline: i64, watermark: Watermark) -> bool {
        if watermark == Watermark::max() {
            return true;
        }
        match self.kind {
            WindowKind::Session => watermark.timestamp > deadline,
            WindowKind::Tumbling | WindowKind::Sliding => watermark.timestamp >= deadline,
        }
    }

    /// Identifier of this window for the given key
    pub fn id(&self, key: &str) -> WindowId {
        WindowId {
            key: key.to_string(),
            start: self.start,
            end: self.end,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.kind, self.start, self.end)
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// Identity of a window result: `(key, start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId {
    pub key: String,
    pub start: i64,
    pub end: i64,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@[{}, {})", self.key, self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains_is_half_open() {
        let w = Window::new(0, 10, WindowKind::Tumbling);
        assert!(w.contains(0));
        assert!(w.contains(9));
        assert!(!w.contains(10));
        assert!(!w.contains(-1));
    }

    #[test]
    fn test_window_overlap_and_merge() {
        let a = Window::new(0, 10, WindowKind::Session);
        let b = Window::new(5, 15, WindowKind::Session);
        let c = Window::new(10, 20, WindowKind::Session);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.merge(&c), Window::new(0, 20, WindowKind::Session));
    }

    #[test]
    fn test_window_closed_by_watermark() {
        let w = Window::new(0, 10, WindowKind::Tumbling);
        assert!(!w.is_closed_by(Watermark::new(9)));
        assert!(w.is_closed_by(Watermark::new(10)));
        assert!(!w.is_closed_by(Watermark::min()));
        assert!(w.is_closed_by(Watermark::max()));
    }

    #[test]
    fn test_session_closes_only_past_its_end() {
        let session = Window::new(0, 10, WindowKind::Session);
        assert!(!session.is_closed_by(Watermark::new(10)));
        assert!(session.is_closed_by(Watermark::new(11)));
        assert!(session.is_closed_by(Watermark::max()));
        assert!(!session.is_past(15, Watermark::new(15)));
    }

    #[test]
    fn test_window_id_display() {
        let id = Window::new(0, 10, WindowKind::Tumbling).id("k1");
        assert_eq!(id.to_string(), "k1@[0, 10)");
    }
}
