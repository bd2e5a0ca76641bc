//! Camera framing math.
//!
//! The framing camera looks straight down. Its square footprint on the ground
//! is `2 * range * tan(fov / 2)` meters wide; insets carve the obstructed
//! strips off that footprint and the camera is shifted so the framed content
//! sits in the middle of what remains.

use super::{CameraTarget, Position};
use crate::geometry::CameraInsets;
use serde::{Deserialize, Serialize};

pub const METERS_PER_DEGREE: f64 = 111_320.0;

const MAX_LATITUDE: f64 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramingConfig {
    pub fov_degrees: f64,
    /// Multiplier applied to the content span.
    pub padding: f64,
    /// Smallest ground extent in meters, so a single point is not framed at
    /// street-sign distance.
    pub min_extent: f64,
    pub max_range: f64,
    pub fly_to_range: f64,
    pub fly_to_tilt: f64,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            fov_degrees: 60.0,
            padding: 1.15,
            min_extent: 400.0,
            max_range: 5_000_000.0,
            fly_to_range: 1_500.0,
            fly_to_tilt: 45.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub center: Position,
    pub heading: f64,
    pub tilt: f64,
    /// Distance from the camera to `center`, in meters.
    pub range: f64,
}

impl Camera {
    /// Resolves an explicit target against the fly-to defaults.
    pub fn from_target(target: &CameraTarget, config: &FramingConfig) -> Self {
        Self {
            center: target.position,
            heading: target.heading.unwrap_or(0.0),
            tilt: target.tilt.unwrap_or(config.fly_to_tilt),
            range: target.range.unwrap_or(config.fly_to_range),
        }
    }

    /// Ground extent of the full viewport in meters (top-down).
    pub fn extent(&self, fov_degrees: f64) -> f64 {
        2.0 * self.range * (fov_degrees.to_radians() / 2.0).tan()
    }

    /// The part of the footprint not covered by overlay panels.
    pub fn unobstructed_bounds(&self, insets: &CameraInsets, fov_degrees: f64) -> Bounds {
        let extent = self.extent(fov_degrees);
        let half_lat = extent / 2.0 / METERS_PER_DEGREE;
        let half_lng = extent / 2.0 / (METERS_PER_DEGREE * cos_lat(self.center.latitude));
        let lat = self.center.latitude;
        let lng = self.center.longitude;
        Bounds {
            north: lat + half_lat - 2.0 * half_lat * insets.top,
            south: lat - half_lat + 2.0 * half_lat * insets.bottom,
            west: lng - half_lng + 2.0 * half_lng * insets.left,
            east: lng + half_lng - 2.0 * half_lng * insets.right,
        }
    }
}

/// An axis-aligned latitude/longitude box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    /// Smallest box enclosing all positions; `None` when there are none.
    pub fn enclosing(positions: &[Position]) -> Option<Self> {
        let first = positions.first()?;
        let seed = Bounds {
            north: first.latitude,
            south: first.latitude,
            east: first.longitude,
            west: first.longitude,
        };
        Some(positions.iter().skip(1).fold(seed, |b, p| Bounds {
            north: b.north.max(p.latitude),
            south: b.south.min(p.latitude),
            east: b.east.max(p.longitude),
            west: b.west.min(p.longitude),
        }))
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.north + self.south) / 2.0, (self.east + self.west) / 2.0)
    }

    pub fn contains(&self, position: &Position) -> bool {
        const EPS: f64 = 1e-9;
        position.latitude <= self.north + EPS
            && position.latitude >= self.south - EPS
            && position.longitude <= self.east + EPS
            && position.longitude >= self.west - EPS
    }
}

fn cos_lat(latitude: f64) -> f64 {
    latitude.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians().cos()
}

/// Computes a top-down camera whose unobstructed area contains every position.
///
/// Returns `None` for an empty slice.
pub fn frame_positions(
    positions: &[Position],
    insets: &CameraInsets,
    config: &FramingConfig,
) -> Option<(Camera, Bounds)> {
    let bounds = Bounds::enclosing(positions)?;
    let (mid_lat, mid_lng) = bounds.center();
    let span_lat = (bounds.north - bounds.south) * config.padding;
    let span_lng = (bounds.east - bounds.west) * config.padding;
    let visible_v = (1.0 - insets.top - insets.bottom).max(0.1);
    let visible_h = (1.0 - insets.left - insets.right).max(0.1);
    let tan_half = (config.fov_degrees.to_radians() / 2.0).tan();

    // The longitude scale depends on the camera latitude, which in turn depends
    // on the extent through the inset shift; a few rounds settle it.
    let mut center_lat = mid_lat;
    let mut extent = config.min_extent;
    for _ in 0..4 {
        let need_v = span_lat * METERS_PER_DEGREE / visible_v;
        let need_h = span_lng * METERS_PER_DEGREE * cos_lat(center_lat) / visible_h;
        extent = need_v
            .max(need_h)
            .max(config.min_extent)
            .min(2.0 * config.max_range * tan_half);
        let half_lat = extent / 2.0 / METERS_PER_DEGREE;
        center_lat = (mid_lat + half_lat * (insets.top - insets.bottom))
            .clamp(-MAX_LATITUDE, MAX_LATITUDE);
    }

    let half_lng = extent / 2.0 / (METERS_PER_DEGREE * cos_lat(center_lat));
    let center_lng = mid_lng - half_lng * (insets.left - insets.right);

    let camera = Camera {
        center: Position::new(center_lat, center_lng),
        heading: 0.0,
        tilt: 0.0,
        range: extent / (2.0 * tan_half),
    };
    Some((camera, bounds))
}
