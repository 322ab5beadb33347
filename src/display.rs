//! Display profile: the real screen size and the smaller "logical" size the
//! model sees and clicks in.

use std::fmt;

use serde::Serialize;

use crate::error::CoordinateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Vision models do best at or below these sizes.
pub const SCALING_TARGETS: [(&str, Resolution); 3] = [
    ("XGA", Resolution::new(1024, 768)),    // 4:3
    ("WXGA", Resolution::new(1280, 800)),   // 16:10
    ("FWXGA", Resolution::new(1366, 768)),  // ~16:9
];

/// How far a target's aspect ratio may drift from the display's.
const ASPECT_TOLERANCE: f64 = 0.02;

/// Picks the scaling target whose aspect ratio is closest to the display's,
/// never one larger than the display. Falls back to the physical size when
/// nothing matches closely enough.
pub fn select_target(physical: Resolution) -> Resolution {
    let aspect = physical.aspect();
    SCALING_TARGETS
        .iter()
        .map(|(_, target)| *target)
        .filter(|target| target.fits_within(&physical))
        .map(|target| (target, (target.aspect() - aspect).abs()))
        .filter(|(_, drift)| *drift < ASPECT_TOLERANCE)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(target, _)| target)
        .unwrap_or(physical)
}

/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayProfile {
    physical: Resolution,
    logical: Resolution,
}

impl DisplayProfile {
    /// Builds the profile for a display, choosing the logical size when
    /// `scaling` is on and using the physical size unchanged otherwise.
    pub fn detect(physical: Resolution, scaling: bool) -> Result<Self, CoordinateError> {
        let logical = if scaling {
            select_target(physical)
        } else {
            physical
        };
        Self::with_logical(physical, logical)
    }

    pub fn with_logical(physical: Resolution, logical: Resolution) -> Result<Self, CoordinateError> {
        for res in [physical, logical] {
            if res.width == 0 || res.height == 0 {
                return Err(CoordinateError::EmptyDisplay {
                    width: res.width,
                    height: res.height,
                });
            }
        }
        Ok(Self { physical, logical })
    }

    pub fn physical(&self) -> Resolution {
        self.physical
    }

    pub fn logical(&self) -> Resolution {
        self.logical
    }

    pub fn scale_x(&self) -> f64 {
        self.physical.width as f64 / self.logical.width as f64
    }

    pub fn scale_y(&self) -> f64 {
        self.physical.height as f64 / self.logical.height as f64
    }

    pub fn is_scaled(&self) -> bool {
        self.physical != self.logical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retina_sixteen_by_ten_picks_wxga() {
        let profile = DisplayProfile::detect(Resolution::new(2560, 1600), true).unwrap();
        assert_eq!(profile.logical(), Resolution::new(1280, 800));
        assert_eq!(profile.scale_x(), 2.0);
        assert_eq!(profile.scale_y(), 2.0);
    }

    #[test]
    fn full_hd_picks_fwxga() {
        assert_eq!(
            select_target(Resolution::new(1920, 1080)),
            Resolution::new(1366, 768)
        );
    }

    #[test]
    fn four_by_three_picks_xga() {
        assert_eq!(
            select_target(Resolution::new(1600, 1200)),
            Resolution::new(1024, 768)
        );
    }

    #[test]
    fn never_upscales_small_displays() {
        let small = Resolution::new(800, 600);
        assert_eq!(select_target(small), small);
    }

    #[test]
    fn exotic_aspect_ratio_keeps_physical_size() {
        let ultrawide = Resolution::new(3440, 1440);
        assert_eq!(select_target(ultrawide), ultrawide);
    }

    #[test]
    fn scaling_disabled_uses_physical() {
        let profile = DisplayProfile::detect(Resolution::new(2560, 1600), false).unwrap();
        assert!(!profile.is_scaled());
        assert_eq!(profile.logical(), profile.physical());
    }

    #[test]
    fn empty_display_is_rejected() {
        assert!(DisplayProfile::detect(Resolution::new(0, 900), true).is_err());
    }
}
