use super::{ActivityType, LocationRequest, MotionState, PlatformOptions, PlatformProfile};
use crate::TrackingConfig;

/// Core Location configured for in-car navigation.
///
/// Delivery is driven by the distance filter rather than a timer, so the
/// request is the same whether or not the vehicle is moving. Automatic
/// pausing stays off: the OS would otherwise suspend updates at long
/// lights and the stop would never be measured.
#[derive(Debug, Clone, Copy, Default)]
pub struct IosProfile;

impl PlatformProfile for IosProfile {
    fn name(&self) -> &'static str {
        "iOS"
    }

    fn location_request(&self, config: &TrackingConfig, _motion: MotionState) -> LocationRequest {
        LocationRequest {
            interval_ms: config.moving_interval_ms,
            min_displacement_m: config.min_displacement_m,
            options: PlatformOptions::Ios {
                activity_type: ActivityType::AutomotiveNavigation,
                shows_background_indicator: true,
                pauses_automatically: false,
            },
        }
    }
}
