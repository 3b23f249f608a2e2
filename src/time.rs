//! Effective windows for rules, references and assumptions.
//!
//! Every versioned input is bitemporal in the calendar sense: it is in force
//! for a half-open date interval `[valid_from, valid_to)`. `valid_to = None`
//! means "currently in force".

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A half-open date interval `[valid_from, valid_to)`.
///
/// # Examples
///
/// ```
/// use factforge::EffectiveWindow;
/// use chrono::NaiveDate;
///
/// let fy = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
/// let window = EffectiveWindow::starting(fy);
/// assert!(window.is_open_ended());
/// assert!(window.contains(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()));
/// assert!(!window.contains(NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveWindow {
    /// First day in force (inclusive).
    pub valid_from: NaiveDate,

    /// First day no longer in force (exclusive). None means open-ended.
    #[serde(default)]
    pub valid_to: Option<NaiveDate>,
}

impl EffectiveWindow {
    /// Creates a closed window.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimeRange` if `valid_from >= valid_to`.
    pub fn new(valid_from: NaiveDate, valid_to: NaiveDate) -> Result<Self, ValidationError> {
        if valid_from >= valid_to {
            return Err(ValidationError::InvalidTimeRange {
                from: valid_from,
                to: valid_to,
            });
        }
        Ok(Self {
            valid_from,
            valid_to: Some(valid_to),
        })
    }

    /// Creates an open-ended window starting on the given day.
    #[must_use]
    pub const fn starting(valid_from: NaiveDate) -> Self {
        Self {
            valid_from,
            valid_to: None,
        }
    }

    /// A window covering every representable date.
    #[must_use]
    pub const fn always() -> Self {
        Self {
            valid_from: NaiveDate::MIN,
            valid_to: None,
        }
    }

    /// Returns true if no end date is set.
    #[must_use]
    pub const fn is_open_ended(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Checks structural validity (a closed window must be non-empty).
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimeRange` for an empty window.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.valid_to {
            Some(to) if to <= self.valid_from => Err(ValidationError::InvalidTimeRange {
                from: self.valid_from,
                to,
            }),
            _ => Ok(()),
        }
    }

    /// Check if a date falls within this window.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.valid_from && self.valid_to.map_or(true, |to| date < to)
    }

    /// Returns true if the two windows share at least one day.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let self_end = self.valid_to.unwrap_or(NaiveDate::MAX);
        let other_end = other.valid_to.unwrap_or(NaiveDate::MAX);
        self.valid_from < other_end && other.valid_from < self_end
    }

    /// Returns the intersection of two windows, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let valid_to = match (self.valid_to, other.valid_to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        Some(Self {
            valid_from: self.valid_from.max(other.valid_from),
            valid_to,
        })
    }

    /// Closes an open-ended window at the given day.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimeRange` if `at` is not after the start.
    pub fn close_at(&mut self, at: NaiveDate) -> Result<(), ValidationError> {
        if at <= self.valid_from {
            return Err(ValidationError::InvalidTimeRange {
                from: self.valid_from,
                to: at,
            });
        }
        self.valid_to = Some(at);
        Ok(())
    }
}

impl std::fmt::Display for EffectiveWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.valid_to {
            Some(to) => write!(f, "[{} → {})", self.valid_from, to),
            None => write!(f, "[{} → ∞)", self.valid_from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_window_new_valid() {
        let window = EffectiveWindow::new(d(2024, 7, 1), d(2025, 7, 1)).unwrap();
        assert_eq!(window.valid_to, Some(d(2025, 7, 1)));
        assert!(!window.is_open_ended());
    }

    #[test]
    fn test_window_new_invalid() {
        assert!(EffectiveWindow::new(d(2025, 7, 1), d(2024, 7, 1)).is_err());
        assert!(EffectiveWindow::new(d(2024, 7, 1), d(2024, 7, 1)).is_err());
    }

    #[test]
    fn test_window_contains_is_half_open() {
        let window = EffectiveWindow::new(d(2024, 7, 1), d(2025, 7, 1)).unwrap();
        assert!(window.contains(d(2024, 7, 1)));
        assert!(window.contains(d(2025, 6, 30)));
        assert!(!window.contains(d(2025, 7, 1)));
        assert!(!window.contains(d(2024, 6, 30)));
    }

    #[test]
    fn test_window_always() {
        let window = EffectiveWindow::always();
        assert!(window.contains(d(1900, 1, 1)));
        assert!(window.contains(d(2100, 1, 1)));
    }

    #[test]
    fn test_window_overlaps() {
        let fy24 = EffectiveWindow::new(d(2023, 7, 1), d(2024, 7, 1)).unwrap();
        let fy25 = EffectiveWindow::new(d(2024, 7, 1), d(2025, 7, 1)).unwrap();
        let from_jan = EffectiveWindow::starting(d(2024, 1, 1));

        assert!(!fy24.overlaps(&fy25));
        assert!(fy24.overlaps(&from_jan));
        assert!(fy25.overlaps(&from_jan));
    }

    #[test]
    fn test_window_intersection() {
        let a = EffectiveWindow::new(d(2023, 7, 1), d(2025, 7, 1)).unwrap();
        let b = EffectiveWindow::starting(d(2024, 7, 1));
        let both = a.intersection(&b).unwrap();
        assert_eq!(both.valid_from, d(2024, 7, 1));
        assert_eq!(both.valid_to, Some(d(2025, 7, 1)));

        let c = EffectiveWindow::new(d(2020, 1, 1), d(2021, 1, 1)).unwrap();
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_window_close_at() {
        let mut window = EffectiveWindow::starting(d(2024, 7, 1));
        window.close_at(d(2025, 7, 1)).unwrap();
        assert_eq!(window.valid_to, Some(d(2025, 7, 1)));

        let mut open = EffectiveWindow::starting(d(2024, 7, 1));
        assert!(open.close_at(d(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_window_validate_rejects_empty() {
        let window = EffectiveWindow {
            valid_from: d(2025, 1, 1),
            valid_to: Some(d(2024, 1, 1)),
        };
        assert!(window.validate().is_err());
        assert!(EffectiveWindow::starting(d(2025, 1, 1)).validate().is_ok());
    }

    #[test]
    fn test_window_serialization() {
        let window = EffectiveWindow::starting(d(2024, 7, 1));
        let json = serde_json::to_string(&window).unwrap();
        assert_eq!(json, r#"{"valid_from":"2024-07-01","valid_to":null}"#);
        let back: EffectiveWindow = serde_json::from_str(r#"{"valid_from":"2024-07-01"}"#).unwrap();
        assert_eq!(back, window);
    }
}
