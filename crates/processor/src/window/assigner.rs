//! Window assigners
//!
//! Maps an event time to the windows that contain it. The set of window
//! strategies is closed, so the assigner is an enum dispatched by `match`.

use serde::{Deserialize, Serialize};

use super::types::{Window, WindowKind};
use crate::error::{WindowError, WindowResult};

/// Strategy for assigning records to windows
///
/// # Example
/// ```text
/// Tumbling(5):    t=7  -> [5, 10)
/// Sliding(10, 5): t=7  -> [0, 10), [5, 15)
/// Session(gap=3): t=7  -> proposal [7, 10), merged with touching sessions
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowAssigner {
    Tumbling { size: i64 },
    Sliding { size: i64, slide: i64 },
    Session { gap: i64 },
}

impl WindowAssigner {
    /// Tumbling windows of `size` milliseconds
    pub fn tumbling(size: i64) -> WindowResult<Self> {
        let assigner = WindowAssigner::Tumbling { size };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Sliding windows of `size` milliseconds starting every `slide` milliseconds
    pub fn sliding(size: i64, slide: i64) -> WindowResult<Self> {
        let assigner = WindowAssigner::Sliding { size, slide };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Session windows closed after `gap` milliseconds of inactivity
    pub fn session(gap: i64) -> WindowResult<Self> {
        let assigner = WindowAssigner::Session { gap };
        assigner.validate()?;
        Ok(assigner)
    }

    /// Check the parameters
    pub fn validate(&self) -> WindowResult<()> {
        match *self {
            WindowAssigner::Tumbling { size } => {
                if size <= 0 {
                    return Err(WindowError::InvalidWindowSize { size });
                }
            }
            WindowAssigner::Sliding { size, slide } => {
                if size <= 0 {
                    return Err(WindowError::InvalidWindowSize { size });
                }
                if slide <= 0 || slide > size {
                    return Err(WindowError::InvalidSlideSize {
                        slide,
                        window: size,
                    });
                }
            }
            WindowAssigner::Session { gap } => {
                if gap <= 0 {
                    return Err(WindowError::InvalidGapSize { gap });
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> WindowKind {
        match self {
            WindowAssigner::Tumbling { .. } => WindowKind::Tumbling,
            WindowAssigner::Sliding { .. } => WindowKind::Sliding,
            WindowAssigner::Session { .. } => WindowKind::Session,
        }
    }

    /// Session windows need merging against existing state
    pub fn is_session(&self) -> bool {
        matches!(self, WindowAssigner::Session { .. })
    }

    /// Upper bound on the number of windows one record lands in
    pub fn max_windows_per_record(&self) -> usize {
        match *self {
            WindowAssigner::Sliding { size, slide } => {
                ((size + slide - 1) / slide).max(1) as usize
            }
            _ => 1,
        }
    }

    /// Windows containing `timestamp`, in ascending start order
    ///
    /// For sessions this is the proposal `[t, t + gap)` before merging.
    pub fn assign(&self, timestamp: i64) -> WindowResult<Vec<Window>> {
        match *self {
            WindowAssigner::Tumbling { size } => {
                let start = timestamp.div_euclid(size) * size;
                Ok(vec![Window::new(
                    start,
                    checked_end(timestamp, start, size)?,
                    WindowKind::Tumbling,
                )])
            }
            WindowAssigner::Sliding { size, slide } => {
                let last_start = timestamp.div_euclid(slide) * slide;
                let mut windows = Vec::with_capacity(self.max_windows_per_record());
                let mut start = last_start;
                loop {
                    let end = checked_end(timestamp, start, size)?;
                    if end <= timestamp {
                        break;
                    }
                    windows.push(Window::new(start, end, WindowKind::Sliding));
                    match start.checked_sub(slide) {
                        Some(prev) => start = prev,
                        None => break,
                    }
                }
                windows.reverse();
                Ok(windows)
            }
            WindowAssigner::Session { gap } => Ok(vec![Window::new(
                timestamp,
                checked_end(timestamp, timestamp, gap)?,
                WindowKind::Session,
            )]),
        }
    }
}

fn checked_end(timestamp: i64, start: i64, size: i64) -> WindowResult<i64> {
    start
        .checked_add(size)
        .ok_or_else(|| WindowError::InvalidTimestamp {
            timestamp,
            reason: "window end overflows the timestamp range".to_string(),
        })
}

/// Merge a session proposal with the existing sessions it touches
///
/// A session `s` touches the proposal `[t, t + gap)` when
/// `s.start <= t + gap && t <= s.end`. Returns the merged window and the
/// existing sessions that were absorbed into it.
pub fn merge_sessions(proposal: Window, existing: &[Window]) -> (Window, Vec<Window>) {
    let mut merged = proposal;
    let mut absorbed = Vec::new();
    for session in existing {
        if session.start <= proposal.end && proposal.start <= session.end {
            merged = merged.merge(session);
            absorbed.push(*session);
        }
    }
    (merged, absorbed)
}
