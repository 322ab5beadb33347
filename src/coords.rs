//! Coordinate translation between the model's logical space and the
//! display's physical space.

use serde_json::Value;

use crate::display::DisplayProfile;
use crate::error::CoordinateError;
use crate::types::{LogicalPoint, PhysicalPoint};

/// Maps a point the model picked onto the physical display.
pub fn to_physical(
    point: LogicalPoint,
    profile: &DisplayProfile,
) -> Result<PhysicalPoint, CoordinateError> {
    let logical = profile.logical();
    let physical = profile.physical();
    check_bounds(point.x, point.y, logical.width, logical.height)?;
    Ok(PhysicalPoint {
        x: scale_axis(point.x, logical.width, physical.width),
        y: scale_axis(point.y, logical.height, physical.height),
    })
}

/// Maps a physical point (e.g. the cursor position) back into model space.
pub fn to_logical(
    point: PhysicalPoint,
    profile: &DisplayProfile,
) -> Result<LogicalPoint, CoordinateError> {
    let logical = profile.logical();
    let physical = profile.physical();
    check_bounds(point.x, point.y, physical.width, physical.height)?;
    Ok(LogicalPoint {
        x: scale_axis(point.x, physical.width, logical.width),
        y: scale_axis(point.y, physical.height, logical.height),
    })
}

/// Reads a `[x, y]` pair from tool input. Bounds are checked on translation.
pub fn parse_coordinate(name: &str, value: &Value) -> Result<LogicalPoint, CoordinateError> {
    let malformed = || CoordinateError::Malformed(name.to_string());
    let pair = value.as_array().filter(|a| a.len() == 2).ok_or_else(malformed)?;
    let x = pair[0].as_i64().ok_or_else(malformed)?;
    let y = pair[1].as_i64().ok_or_else(malformed)?;
    if x < 0 || y < 0 {
        return Err(CoordinateError::Negative { x, y });
    }
    let x = u32::try_from(x).map_err(|_| malformed())?;
    let y = u32::try_from(y).map_err(|_| malformed())?;
    Ok(LogicalPoint { x, y })
}

fn check_bounds(x: u32, y: u32, width: u32, height: u32) -> Result<(), CoordinateError> {
    if x >= width || y >= height {
        return Err(CoordinateError::OutOfBounds {
            x,
            y,
            width,
            height,
        });
    }
    Ok(())
}

// Rounds to the nearest pixel; the clamp only absorbs rounding at the far edge.
fn scale_axis(value: u32, from: u32, to: u32) -> u32 {
    let scaled = (value as f64 * to as f64 / from as f64).round();
    (scaled as u32).min(to - 1)
}
