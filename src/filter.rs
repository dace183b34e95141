//! Noise rejection for raw location fixes.
//!
//! The filter is pure: it only looks at the candidate fix and the last
//! accepted point, which the caller owns and updates on acceptance.
//! Checks run in order and the first rejection wins:
//!
//! 1. Accuracy gate (missing or too coarse)
//! 2. Bootstrap: with no prior point, accept
//! 3. Jitter: closer than the minimum distance to the prior point
//! 4. Teleport: implied speed above the maximum plausible jump

use crate::geo_utils::{elapsed_seconds, haversine_distance};
use crate::{AcceptedPoint, RawFix, TrackingConfig};

/// Why a fix was dropped. Rejections are normal operation, not errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RejectReason {
    /// NaN or out-of-range coordinates
    InvalidCoordinates,
    /// Accuracy missing, non-finite, or above the accuracy gate
    Inaccurate { accuracy_meters: Option<f64> },
    /// Too close to the last accepted point to be real movement
    Jitter { distance_meters: f64 },
    /// Implied speed from the last accepted point is implausible
    Teleport { implied_speed_mps: f64 },
}

/// Outcome of running a fix through the filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterDecision {
    Accepted(AcceptedPoint),
    Rejected(RejectReason),
}

impl FilterDecision {
    pub fn accepted(self) -> Option<AcceptedPoint> {
        match self {
            FilterDecision::Accepted(point) => Some(point),
            FilterDecision::Rejected(_) => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accepted(_))
    }
}

/// Accuracy / jitter / teleport filter chain.
#[derive(Debug, Clone)]
pub struct PointFilter {
    min_accuracy_m: f64,
    min_distance_threshold_m: f64,
    max_speed_jump_mps: f64,
}

impl PointFilter {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            min_accuracy_m: config.min_accuracy_m,
            min_distance_threshold_m: config.min_distance_threshold_m,
            max_speed_jump_mps: config.max_speed_jump_mps,
        }
    }

    /// Decide whether `raw` is trustworthy given the last accepted point.
    pub fn evaluate(&self, raw: &RawFix, last: Option<&AcceptedPoint>) -> FilterDecision {
        if !raw.is_valid() {
            return FilterDecision::Rejected(RejectReason::InvalidCoordinates);
        }

        let accuracy = match raw.accuracy_meters {
            Some(acc) if acc.is_finite() && acc <= self.min_accuracy_m => acc,
            other => {
                return FilterDecision::Rejected(RejectReason::Inaccurate {
                    accuracy_meters: other,
                })
            }
        };

        let Some(prev) = last else {
            return FilterDecision::Accepted(AcceptedPoint::from_fix(raw, accuracy));
        };

        let distance = haversine_distance(
            prev.latitude(),
            prev.longitude(),
            raw.latitude,
            raw.longitude,
        );
        if distance < self.min_distance_threshold_m {
            return FilterDecision::Rejected(RejectReason::Jitter {
                distance_meters: distance,
            });
        }

        let dt = elapsed_seconds(prev.timestamp_ms(), raw.timestamp_ms);
        if dt > 0.0 {
            let implied_speed = distance / dt;
            if implied_speed > self.max_speed_jump_mps {
                return FilterDecision::Rejected(RejectReason::Teleport {
                    implied_speed_mps: implied_speed,
                });
            }
        }

        FilterDecision::Accepted(AcceptedPoint::from_fix(raw, accuracy))
    }
}

impl Default for PointFilter {
    fn default() -> Self {
        Self::new(&TrackingConfig::default())
    }
}
