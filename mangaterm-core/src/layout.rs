use std::ops::Range;

use crate::page::PageDescriptor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutEntry {
    pub index: usize,
    pub rendered_height: f64,
    pub cumulative_start: f64,
}

impl LayoutEntry {
    pub fn end(&self) -> f64 {
        self.cumulative_start + self.rendered_height
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageLayout {
    viewport_width: f64,
    entries: Vec<LayoutEntry>,
}

impl PageLayout {
    pub fn compute(pages: &[PageDescriptor], viewport_width: f64) -> Self {
        let mut layout = Self {
            viewport_width,
            entries: Vec::with_capacity(pages.len()),
        };
        layout.rebuild_from(pages, 0);
        layout
    }

    pub fn viewport_width(&self) -> f64 {
        self.viewport_width
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&LayoutEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_height(&self) -> f64 {
        self.entries.last().map(LayoutEntry::end).unwrap_or(0.0)
    }

    pub fn set_viewport_width(&mut self, pages: &[PageDescriptor], viewport_width: f64) {
        self.viewport_width = viewport_width;
        self.rebuild_from(pages, 0);
    }

    /// Recomputes entries from `first_changed` onward. Earlier entries keep
    /// their heights and offsets.
    pub fn invalidate_from(&mut self, pages: &[PageDescriptor], first_changed: usize) {
        self.rebuild_from(pages, first_changed);
    }

    fn rebuild_from(&mut self, pages: &[PageDescriptor], first_changed: usize) {
        let start = first_changed.min(self.entries.len()).min(pages.len());
        self.entries.truncate(start);
        let mut cursor = self.entries.last().map(LayoutEntry::end).unwrap_or(0.0);
        for page in &pages[start..] {
            let rendered_height = page.status.rendered_height(self.viewport_width);
            self.entries.push(LayoutEntry {
                index: page.index,
                rendered_height,
                cumulative_start: cursor,
            });
            cursor += rendered_height;
        }
    }

    /// Page whose band `[start, end)` contains `offset`. A run of unsized pages
    /// sharing one start resolves to the first page of the run.
    pub fn page_at_offset(&self, offset: f64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let after = self
            .entries
            .partition_point(|entry| entry.cumulative_start <= offset);
        let last = after.saturating_sub(1);
        if self.entries[last].rendered_height > 0.0 {
            return Some(last);
        }
        // Only zero-height pages start here: take the first of them.
        let start = self.entries[last].cumulative_start;
        let first = self.entries[..last]
            .iter()
            .rposition(|entry| entry.cumulative_start < start)
            .map_or(0, |before| before + 1);
        Some(first)
    }

    pub fn offset_of(&self, index: usize) -> Option<f64> {
        self.entries.get(index).map(|entry| entry.cumulative_start)
    }

    pub fn pages_in_band(&self, top: f64, height: f64) -> Range<usize> {
        let Some(first) = self.page_at_offset(top) else {
            return 0..0;
        };
        let bottom = top + height.max(0.0);
        let mut end = self
            .entries
            .partition_point(|entry| entry.cumulative_start < bottom)
            .max(first + 1)
            .min(self.entries.len());
        // Unsized pages at the bottom edge occupy no space yet.
        while end > first + 1 && self.entries[end - 1].rendered_height == 0.0 {
            end -= 1;
        }
        first..end
    }
}
