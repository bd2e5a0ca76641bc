//! Map View State and Viewport Commands
//!
//! The map viewport lives in the client. The server mirrors what the map
//! should show (`ViewState`) and drives the viewport through a narrow command
//! protocol. Only the `MapChoreographer` writes the view state; everything else
//! submits `MapRequest`s to it.

mod camera;
mod choreographer;

pub use camera::{Bounds, Camera, FramingConfig, METERS_PER_DEGREE, frame_positions};
pub use choreographer::MapChoreographer;

use crate::geometry::CameraInsets;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A point on the globe. Altitude is in meters above ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub position: Position,
    pub label: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// An explicit camera destination. Unset fields fall back to the framing
/// defaults when the transition is issued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraTarget {
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tilt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
}

impl CameraTarget {
    pub fn at(position: Position) -> Self {
        Self {
            position,
            heading: None,
            tilt: None,
            range: None,
        }
    }
}

/// What the map should show.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub markers: Vec<Marker>,
    pub pending_target: Option<CameraTarget>,
}

/// Commands understood by the client viewport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ViewportCommand {
    SetMarkers {
        markers: Vec<Marker>,
    },
    ClearMarkers,
    FlyTo {
        transition_id: u64,
        camera: Camera,
    },
    FrameBounds {
        transition_id: u64,
        camera: Camera,
        bounds: Bounds,
        insets: CameraInsets,
    },
    CancelTransition {
        transition_id: u64,
    },
}

/// The client-side map as seen from the server.
#[cfg_attr(test, mockall::automock)]
pub trait Viewport: Send + Sync {
    fn submit(&mut self, command: ViewportCommand);
}

/// A single logical change requested by a tool handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewUpdate {
    pub markers: Option<Vec<Marker>>,
    pub target: Option<CameraTarget>,
}

/// Requests sent to the owner of the choreographer.
#[derive(Debug, Clone, PartialEq)]
pub enum MapRequest {
    Update(ViewUpdate),
    Clear,
}
