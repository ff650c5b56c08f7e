use crate::page::Viewport;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureEvent {
    Move { x: f64, y: f64 },
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollCommand {
    pub offset: f64,
    pub animated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrubState {
    #[default]
    Idle,
    Dragging,
}

#[derive(Debug, Clone)]
pub struct ScrubController {
    lane_width: f64,
    state: ScrubState,
}

impl ScrubController {
    pub fn new(lane_width: f64) -> Self {
        Self {
            lane_width: lane_width.max(0.0),
            state: ScrubState::Idle,
        }
    }

    pub fn state(&self) -> ScrubState {
        self.state
    }

    pub fn lane_width(&self) -> f64 {
        self.lane_width
    }

    pub fn in_lane(&self, x: f64, viewport: Viewport) -> bool {
        self.lane_width > 0.0 && x >= viewport.width - self.lane_width && x <= viewport.width
    }

    /// Feeds one input event. Every move while dragging yields exactly one
    /// command, unless there is nothing to scroll yet.
    pub fn handle(
        &mut self,
        event: GestureEvent,
        viewport: Viewport,
        total_height: f64,
    ) -> Option<ScrollCommand> {
        match (self.state, event) {
            (_, GestureEvent::Release) => {
                self.state = ScrubState::Idle;
                None
            }
            (ScrubState::Idle, GestureEvent::Move { x, .. }) if !self.in_lane(x, viewport) => None,
            (_, GestureEvent::Move { y, .. }) => {
                self.state = ScrubState::Dragging;
                target_offset(y, viewport.height, total_height).map(|offset| ScrollCommand {
                    offset,
                    animated: false,
                })
            }
        }
    }
}

/// `clamp(y / viewport_height, 0, 1) * total_height`.
pub fn target_offset(y: f64, viewport_height: f64, total_height: f64) -> Option<f64> {
    let positive = |value: f64| value.is_finite() && value > 0.0;
    if !positive(total_height) || !positive(viewport_height) || !y.is_finite() {
        return None;
    }
    let fraction = (y / viewport_height).clamp(0.0, 1.0);
    Some(fraction * total_height)
}
