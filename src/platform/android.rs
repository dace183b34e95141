use super::{LocationPriority, LocationRequest, MotionState, PlatformOptions, PlatformProfile};
use crate::TrackingConfig;

/// Fused location provider behind a foreground service.
///
/// Android samples on a timer, so a parked vehicle is polled less often.
#[derive(Debug, Clone, Copy, Default)]
pub struct AndroidProfile;

impl PlatformProfile for AndroidProfile {
    fn name(&self) -> &'static str {
        "Android"
    }

    fn location_request(&self, config: &TrackingConfig, motion: MotionState) -> LocationRequest {
        let interval_ms = match motion {
            MotionState::Moving => config.moving_interval_ms,
            MotionState::Stationary => config.stopped_interval_ms,
        };
        LocationRequest {
            interval_ms,
            min_displacement_m: config.min_displacement_m,
            options: PlatformOptions::Android {
                priority: LocationPriority::HighAccuracy,
                foreground_notification: true,
            },
        }
    }
}
