use std::ops::Range;

use tracing::trace;

use crate::config::WindowConfig;
use crate::layout::PageLayout;

/// Mounted pages ahead of (or behind) the visible band at which the window
/// grows by another batch.
const EDGE_MARGIN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollState {
    pub total_height: f64,
    pub current_offset: f64,
}

impl ScrollState {
    fn clamp(&mut self) {
        if !self.current_offset.is_finite() {
            self.current_offset = 0.0;
        }
        self.current_offset = self.current_offset.clamp(0.0, self.total_height.max(0.0));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MountedPage {
    pub index: usize,
    pub top: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowChange {
    pub mounted: Vec<usize>,
    pub unmounted: Vec<usize>,
}

impl WindowChange {
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty() && self.unmounted.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
pub struct WindowRenderer {
    config: WindowConfig,
    viewport_height: f64,
    scroll: ScrollState,
    mounted: Range<usize>,
    direction: Direction,
}

impl WindowRenderer {
    pub fn new(config: WindowConfig, viewport_height: f64) -> Self {
        Self {
            config,
            viewport_height: viewport_height.max(0.0),
            scroll: ScrollState::default(),
            mounted: 0..0,
            direction: Direction::Forward,
        }
    }

    pub fn scroll(&self) -> ScrollState {
        self.scroll
    }

    pub fn mounted(&self) -> Range<usize> {
        self.mounted.clone()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounted.len()
    }

    pub fn is_mounted(&self, index: usize) -> bool {
        self.mounted.contains(&index)
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        self.viewport_height = height.max(0.0);
    }

    pub fn mounted_pages(&self, layout: &PageLayout) -> Vec<MountedPage> {
        self.mounted
            .clone()
            .filter_map(|index| layout.entry(index))
            .map(|entry| MountedPage {
                index: entry.index,
                top: entry.cumulative_start,
                height: entry.rendered_height,
            })
            .collect()
    }

    pub fn sync(&mut self, layout: &PageLayout) -> WindowChange {
        self.scroll.total_height = layout.total_height();
        self.scroll.clamp();
        self.reposition(layout)
    }

    pub fn scroll_to(&mut self, offset: f64, layout: &PageLayout) -> WindowChange {
        self.scroll.total_height = layout.total_height();
        let previous = self.scroll.current_offset;
        self.scroll.current_offset = offset;
        self.scroll.clamp();
        if self.scroll.current_offset > previous {
            self.direction = Direction::Forward;
        } else if self.scroll.current_offset < previous {
            self.direction = Direction::Backward;
        }
        self.reposition(layout)
    }

    pub fn scroll_by(&mut self, delta: f64, layout: &PageLayout) -> WindowChange {
        self.scroll_to(self.scroll.current_offset + delta, layout)
    }

    fn reposition(&mut self, layout: &PageLayout) -> WindowChange {
        let len = layout.len();
        if len == 0 {
            return self.replace(0..0);
        }

        let visible = layout.pages_in_band(self.scroll.current_offset, self.viewport_height);
        let batch = self.config.batch.max(1);
        let mut next = self.mounted.start.min(len)..self.mounted.end.min(len);

        if next.is_empty() {
            next = 0..self.config.initial.max(1).min(len);
        }

        if visible.start >= next.end || visible.end <= next.start {
            // Landed outside the mounted range: re-seat around the landing page.
            next = visible.clone();
            match self.direction {
                Direction::Forward => next.end = (next.end + batch).min(len),
                Direction::Backward => next.start = next.start.saturating_sub(batch),
            }
        } else {
            if next.end < len && next.end.saturating_sub(visible.end) <= EDGE_MARGIN {
                next.end = (next.end.max(visible.end) + batch).min(len);
            }
            if next.start > 0 && visible.start.saturating_sub(next.start) <= EDGE_MARGIN {
                next.start = next.start.min(visible.start).saturating_sub(batch);
            }
            next.start = next.start.min(visible.start);
            next.end = next.end.max(visible.end);
        }

        let cap = self.config.window.max(1);
        while next.len() > cap {
            let behind = visible.start - next.start;
            let ahead = next.end - visible.end;
            let trim_front = match self.direction {
                Direction::Forward => behind > 0,
                Direction::Backward => ahead == 0 && behind > 0,
            };
            if trim_front {
                next.start += 1;
            } else if ahead > 0 {
                next.end -= 1;
            } else {
                // The visible band alone exceeds the cap.
                next.end = next.start + cap;
            }
        }

        self.replace(next)
    }

    fn replace(&mut self, next: Range<usize>) -> WindowChange {
        let previous = std::mem::replace(&mut self.mounted, next);
        let change = WindowChange {
            mounted: self
                .mounted
                .clone()
                .filter(|index| !previous.contains(index))
                .collect(),
            unmounted: previous
                .filter(|index| !self.mounted.contains(index))
                .collect(),
        };
        if !change.is_empty() {
            trace!(
                mounted = ?self.mounted,
                entered = change.mounted.len(),
                left = change.unmounted.len(),
                "window moved"
            );
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageDescriptor, PageStatus};

    fn uniform_layout(count: usize, width: u32, height: u32) -> PageLayout {
        let pages: Vec<_> = (0..count)
            .map(|index| PageDescriptor {
                index,
                url: format!("{index}.png"),
                status: PageStatus::Resolved { width, height },
            })
            .collect();
        PageLayout::compute(&pages, f64::from(width))
    }

    fn defaults() -> WindowConfig {
        WindowConfig {
            initial: 5,
            batch: 4,
            window: 7,
        }
    }

    #[test]
    fn initial_window_is_mounted_on_first_sync() {
        let layout = uniform_layout(50, 100, 100);
        let mut window = WindowRenderer::new(defaults(), 250.0);
        let change = window.sync(&layout);
        assert_eq!(window.mounted(), 0..5);
        assert_eq!(change.mounted, vec![0, 1, 2, 3, 4]);
        assert!(change.unmounted.is_empty());
    }

    #[test]
    fn scrolling_to_the_end_never_exceeds_window() {
        let layout = uniform_layout(50, 100, 100);
        let mut window = WindowRenderer::new(defaults(), 250.0);
        window.sync(&layout);
        while window.scroll().current_offset < layout.total_height() {
            window.scroll_by(37.0, &layout);
            assert!(window.mounted_count() <= 7, "mounted {:?}", window.mounted());
            let visible =
                layout.pages_in_band(window.scroll().current_offset, 250.0);
            assert!(window.is_mounted(visible.start));
        }
        assert_eq!(window.scroll().current_offset, 5000.0);
        assert!(window.is_mounted(49));
        assert!(!window.is_mounted(0));
    }

    #[test]
    fn scrolling_back_keeps_bound_and_coverage() {
        let layout = uniform_layout(30, 100, 100);
        let mut window = WindowRenderer::new(defaults(), 150.0);
        window.sync(&layout);
        window.scroll_to(layout.total_height(), &layout);
        while window.scroll().current_offset > 0.0 {
            window.scroll_by(-45.0, &layout);
            assert!(window.mounted_count() <= 7);
            let top = layout.page_at_offset(window.scroll().current_offset).unwrap();
            assert!(window.is_mounted(top));
        }
        assert!(window.is_mounted(0));
    }

    #[test]
    fn jump_reseats_window_and_reports_changes() {
        let layout = uniform_layout(50, 100, 100);
        let mut window = WindowRenderer::new(defaults(), 250.0);
        window.sync(&layout);
        let change = window.scroll_to(2500.0, &layout);
        assert!(window.is_mounted(25));
        assert!(window.mounted_count() <= 7);
        assert_eq!(change.unmounted, vec![0, 1, 2, 3, 4]);
        assert!(change.mounted.contains(&25));
    }

    #[test]
    fn offsets_are_clamped() {
        let layout = uniform_layout(3, 400, 400);
        let mut window = WindowRenderer::new(defaults(), 300.0);
        window.sync(&layout);
        window.scroll_to(-20.0, &layout);
        assert_eq!(window.scroll().current_offset, 0.0);
        window.scroll_to(1e9, &layout);
        assert_eq!(window.scroll().current_offset, 1200.0);
        window.scroll_to(f64::NAN, &layout);
        assert_eq!(window.scroll().current_offset, 0.0);
    }

    #[test]
    fn appending_pages_does_not_move_mounted_ones() {
        let layout = uniform_layout(50, 100, 150);
        let mut window = WindowRenderer::new(defaults(), 200.0);
        window.sync(&layout);
        let before = window.mounted_pages(&layout);
        let change = window.scroll_by(300.0, &layout);
        assert!(!change.mounted.is_empty());
        let after = window.mounted_pages(&layout);
        for page in &after {
            if let Some(old) = before.iter().find(|p| p.index == page.index) {
                assert_eq!(old, page);
            }
        }
    }

    #[test]
    fn empty_layout_unmounts_everything() {
        let layout = uniform_layout(10, 100, 100);
        let mut window = WindowRenderer::new(defaults(), 100.0);
        window.sync(&layout);
        let change = window.sync(&PageLayout::default());
        assert_eq!(change.unmounted.len(), 5);
        assert_eq!(window.mounted_count(), 0);
    }
}
