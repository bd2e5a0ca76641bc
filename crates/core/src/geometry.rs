//! Geometry Resolver
//!
//! Turns the overlay layout reported by the client (viewport size, transcript
//! panel, control tray) into fractional camera insets so that framed map
//! content is never hidden behind the UI.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pixel size of an overlay panel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelSize {
    pub width: f64,
    pub height: f64,
}

/// A snapshot of the client layout, sent on mount and on every resize.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutSnapshot {
    pub viewport_width: f64,
    pub viewport_height: f64,
    /// The transcript panel; `None` while it is not mounted.
    #[serde(default)]
    pub transcript_panel: Option<PanelSize>,
    /// The control tray; `None` while it is not mounted.
    #[serde(default)]
    pub control_tray: Option<PanelSize>,
}

/// Fractions of the viewport obstructed on each edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraInsets {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl CameraInsets {
    pub fn uniform(value: f64) -> Self {
        Self {
            top: value,
            right: value,
            bottom: value,
            left: value,
        }
    }
}

impl Default for CameraInsets {
    fn default() -> Self {
        Self::uniform(GeometryConfig::default().floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryConfig {
    /// Minimum inset on every side.
    pub floor: f64,
    /// Maximum inset on any side; keeps an unobstructed area for framing.
    pub ceiling: f64,
    /// Viewports narrower than this are treated as mobile.
    pub mobile_breakpoint: f64,
    /// Gap in pixels kept between a docked panel and framed content.
    pub panel_margin: f64,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            floor: 0.05,
            ceiling: 0.45,
            mobile_breakpoint: 768.0,
            panel_margin: 24.0,
        }
    }
}

/// Computes insets for a layout snapshot.
///
/// Invalid viewport dimensions (zero, negative, NaN) yield the floor on every
/// side rather than an error.
pub fn resolve_insets(layout: &LayoutSnapshot, config: &GeometryConfig) -> CameraInsets {
    let floor = CameraInsets::uniform(config.floor);
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !valid(layout.viewport_width) || !valid(layout.viewport_height) {
        debug!(?layout, "Viewport not measurable yet, using floor insets");
        return floor;
    }

    let clamp = |fraction: f64| {
        if fraction.is_finite() {
            fraction.clamp(config.floor, config.ceiling)
        } else {
            config.floor
        }
    };

    let is_mobile = layout.viewport_width < config.mobile_breakpoint;

    // Panels overlay rather than dock on narrow screens.
    let left = match layout.transcript_panel {
        Some(panel) if !is_mobile && panel.width > 0.0 => {
            clamp((panel.width + config.panel_margin) / layout.viewport_width)
        }
        _ => config.floor,
    };

    let bottom = match layout.control_tray {
        Some(tray) if tray.height > 0.0 => {
            clamp((tray.height + config.panel_margin) / layout.viewport_height)
        }
        _ => config.floor,
    };

    CameraInsets {
        top: config.floor,
        right: config.floor,
        bottom,
        left,
    }
}

/// Tracks layout notifications and holds back the first one until the layout
/// has had time to settle after mount.
#[derive(Debug)]
pub struct GeometryResolver {
    config: GeometryConfig,
    settled: bool,
    latest: Option<LayoutSnapshot>,
    insets: CameraInsets,
}

impl GeometryResolver {
    pub fn new(config: GeometryConfig) -> Self {
        Self {
            config,
            settled: false,
            latest: None,
            insets: CameraInsets::uniform(config.floor),
        }
    }

    /// The most recently resolved insets (floor defaults until settled).
    pub fn insets(&self) -> CameraInsets {
        self.insets
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Records a layout notification.
    ///
    /// Returns the new insets once settled and only when they changed; before
    /// settling the snapshot is stored and `None` is returned.
    pub fn observe(&mut self, layout: LayoutSnapshot) -> Option<CameraInsets> {
        self.latest = Some(layout);
        if !self.settled {
            return None;
        }
        self.recompute()
    }

    /// Ends the settle window and resolves the latest snapshot.
    pub fn settle(&mut self) -> CameraInsets {
        self.settled = true;
        self.recompute();
        self.insets
    }

    fn recompute(&mut self) -> Option<CameraInsets> {
        let next = match &self.latest {
            Some(layout) => resolve_insets(layout, &self.config),
            None => CameraInsets::uniform(self.config.floor),
        };
        if next == self.insets {
            return None;
        }
        self.insets = next;
        Some(next)
    }
}
