use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    Pending,
    Resolved { width: u32, height: u32 },
    Failed,
}

impl PageStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, PageStatus::Pending)
    }

    /// Rendered height for a page of this status at `viewport_width`.
    ///
    /// Pending pages occupy no height until they settle.
    pub fn rendered_height(&self, viewport_width: f64) -> f64 {
        match *self {
            PageStatus::Pending => 0.0,
            PageStatus::Resolved { width, height } if width > 0 && height > 0 => {
                // viewport_width / (width / height), without the rounding of
                // the intermediate ratio
                viewport_width * f64::from(height) / f64::from(width)
            }
            PageStatus::Resolved { .. } | PageStatus::Failed => viewport_width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub index: usize,
    pub url: String,
    pub status: PageStatus,
}

impl PageDescriptor {
    pub fn pending(index: usize, url: String) -> Self {
        Self {
            index,
            url,
            status: PageStatus::Pending,
        }
    }

    /// Moves a pending page to its final status. Returns `false` and leaves the
    /// page untouched when it has already settled.
    pub fn settle(&mut self, status: PageStatus) -> bool {
        if self.status.is_settled() || !status.is_settled() {
            return false;
        }
        self.status = match status {
            PageStatus::Resolved { width, height } if width == 0 || height == 0 => {
                PageStatus::Failed
            }
            other => other,
        };
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: sanitize(width),
            height: sanitize(height),
        }
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
