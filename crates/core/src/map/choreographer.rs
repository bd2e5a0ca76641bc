//! The single writer of the map view state.

use super::{
    Camera, CameraTarget, FramingConfig, MapRequest, Marker, Position, ViewState, ViewUpdate,
    Viewport, ViewportCommand, frame_positions,
};
use crate::geometry::CameraInsets;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    id: u64,
    target: Option<CameraTarget>,
}

/// Owns the mirrored `ViewState` and issues camera operations to the viewport.
///
/// While no viewport is attached every operation still updates the mirrored
/// state, but commands are dropped rather than queued: the next state change
/// after attach re-derives the view.
pub struct MapChoreographer {
    view: ViewState,
    insets: CameraInsets,
    framing: FramingConfig,
    viewport: Option<Box<dyn Viewport>>,
    suppress_auto_frame: bool,
    in_flight: Option<Transition>,
    next_transition_id: u64,
}

impl MapChoreographer {
    pub fn new(framing: FramingConfig) -> Self {
        Self {
            view: ViewState::default(),
            insets: CameraInsets::default(),
            framing,
            viewport: None,
            suppress_auto_frame: false,
            in_flight: None,
            next_transition_id: 1,
        }
    }

    pub fn attach(&mut self, viewport: Box<dyn Viewport>) {
        info!("Viewport attached");
        self.viewport = Some(viewport);
    }

    pub fn detach(&mut self) {
        info!("Viewport detached");
        self.viewport = None;
        self.in_flight = None;
    }

    pub fn is_attached(&self) -> bool {
        self.viewport.is_some()
    }

    pub fn view_state(&self) -> &ViewState {
        &self.view
    }

    pub fn insets(&self) -> CameraInsets {
        self.insets
    }

    pub fn set_insets(&mut self, insets: CameraInsets) {
        self.insets = insets;
    }

    pub fn is_auto_frame_suppressed(&self) -> bool {
        self.suppress_auto_frame
    }

    /// Id of the camera transition currently running, if any.
    pub fn in_flight_transition(&self) -> Option<u64> {
        self.in_flight.map(|t| t.id)
    }

    /// Applies a request coming from a tool handler.
    pub fn handle(&mut self, request: MapRequest) {
        match request {
            MapRequest::Update(update) => self.apply(update),
            MapRequest::Clear => self.clear(),
        }
    }

    /// Applies one logical update. An explicit target is consumed first so
    /// that it wins over the re-frame the marker change would otherwise cause.
    pub fn apply(&mut self, update: ViewUpdate) {
        if let Some(target) = update.target {
            self.fly_to(target);
        }
        if let Some(markers) = update.markers {
            self.set_markers(markers);
        }
    }

    /// Removes every marker. Counts as a marker-set change.
    pub fn clear(&mut self) {
        self.suppress_auto_frame = false;
        if self.view.markers.is_empty() {
            return;
        }
        self.view.markers.clear();
        self.submit(ViewportCommand::ClearMarkers);
    }

    /// Replaces the whole marker set and re-frames unless a fly-to asked for
    /// the next re-frame to be skipped.
    pub fn set_markers(&mut self, markers: Vec<Marker>) {
        self.view.markers = markers;
        self.submit(ViewportCommand::SetMarkers {
            markers: self.view.markers.clone(),
        });

        if self.suppress_auto_frame {
            debug!("Auto-frame suppressed by a recent fly-to; releasing suppression");
            self.suppress_auto_frame = false;
            return;
        }
        let positions: Vec<Position> = self.view.markers.iter().map(|m| m.position).collect();
        self.frame(&positions, self.insets);
    }

    /// Frames `positions` inside `insets` with a single camera transition.
    ///
    /// Returns the issued camera, or `None` when nothing was issued (empty
    /// input or auto-frame suppressed).
    pub fn frame(&mut self, positions: &[Position], insets: CameraInsets) -> Option<Camera> {
        if self.suppress_auto_frame {
            return None;
        }
        let (camera, bounds) = frame_positions(positions, &insets, &self.framing)?;
        let transition_id = self.begin_transition(None);
        self.submit(ViewportCommand::FrameBounds {
            transition_id,
            camera,
            bounds,
            insets,
        });
        Some(camera)
    }

    /// Flies the camera to an explicit target.
    ///
    /// The target goes through `pending_target` and is consumed exactly once.
    /// A request for the target already being flown to is ignored; any other
    /// in-flight transition is cancelled.
    pub fn fly_to(&mut self, target: CameraTarget) {
        self.view.pending_target = Some(target);
        let Some(target) = self.view.pending_target.take() else {
            return;
        };
        self.suppress_auto_frame = true;

        if let Some(current) = self.in_flight {
            if current.target == Some(target) {
                debug!(transition_id = current.id, "Fly-to already heading to this target");
                return;
            }
        }
        let camera = Camera::from_target(&target, &self.framing);
        let transition_id = self.begin_transition(Some(target));
        self.submit(ViewportCommand::FlyTo {
            transition_id,
            camera,
        });
    }

    /// Called when the viewport reports that a transition ended.
    pub fn on_transition_finished(&mut self, transition_id: u64) {
        if self.in_flight.map(|t| t.id) == Some(transition_id) {
            self.in_flight = None;
        }
    }

    /// The user grabbed the camera; whatever transition was running is over.
    pub fn on_camera_interaction(&mut self) {
        if let Some(transition) = self.in_flight.take() {
            debug!(transition_id = transition.id, "Camera transition taken over by the user");
        }
    }

    /// Seeds the mirrored markers of a view the client already shows.
    /// Issues nothing; `resync` sends them once a viewport is attached.
    pub fn restore(&mut self, markers: Vec<Marker>) {
        self.view.markers = markers;
    }

    /// Re-sends the mirrored markers, e.g. after a viewport (re)attached.
    pub fn resync(&mut self) {
        if self.view.markers.is_empty() {
            return;
        }
        self.submit(ViewportCommand::SetMarkers {
            markers: self.view.markers.clone(),
        });
    }

    fn begin_transition(&mut self, target: Option<CameraTarget>) -> u64 {
        if let Some(previous) = self.in_flight.take() {
            self.submit(ViewportCommand::CancelTransition {
                transition_id: previous.id,
            });
        }
        let id = self.next_transition_id;
        self.next_transition_id += 1;
        if self.viewport.is_some() {
            self.in_flight = Some(Transition { id, target });
        }
        id
    }

    fn submit(&mut self, command: ViewportCommand) {
        match self.viewport.as_mut() {
            Some(viewport) => viewport.submit(command),
            None => debug!(?command, "No viewport attached, dropping command"),
        }
    }
}
