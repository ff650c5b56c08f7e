//! Chapter page pipeline: manifest resolution, bounded-concurrency size
//! probing, layout, windowed page mounting and scrubbing.

pub mod catalog;
pub mod config;
pub mod dimensions;
pub mod error;
pub mod layout;
pub mod library;
pub mod manifest;
pub mod page;
pub mod scrub;
pub mod session;
pub mod store;
pub mod window;

use uuid::Uuid;

pub use catalog::{
    ChapterSummary, FeedPage, FeedRequest, ListKind, ListRequest, MangaPage, MangaSummary,
    SearchRequest, SortDirection, SortField, Tag,
};
pub use config::{PipelineConfig, ReaderConfig, WindowConfig};
pub use dimensions::{DimensionResolver, DimensionUpdate, PageRequest, ResolveSummary, SizeProbe};
pub use error::{ReaderError, ReaderResult};
pub use layout::{LayoutEntry, PageLayout};
pub use library::{ImageDimensions, Library, SavedImage};
pub use manifest::{ChapterManifest, ManifestResolver, ManifestSource, ResolvedChapter};
pub use page::{PageDescriptor, PageStatus, Viewport};
pub use scrub::{GestureEvent, ScrollCommand, ScrubController, ScrubState};
pub use session::{ChapterSession, ReaderCommand, ReaderEvent, SessionStatus};
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use window::{MountedPage, ScrollState, WindowChange, WindowRenderer};

pub type MangaId = Uuid;
pub type ChapterId = Uuid;

/// Identifies one open chapter view; updates carrying another token are
/// discarded.
pub type SessionToken = Uuid;

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    pub fn crop_rows(&self, top: u32, height: u32) -> RenderImage {
        if self.width == 0 || self.height == 0 {
            return RenderImage {
                width: 0,
                height: 0,
                pixels: Vec::new(),
            };
        }
        let top = top.min(self.height - 1);
        let height = height.min(self.height - top).max(1);
        let stride = self.width as usize * 4;
        let start = top as usize * stride;
        let end = start + height as usize * stride;
        RenderImage {
            width: self.width,
            height,
            pixels: self
                .pixels
                .get(start..end)
                .map(<[u8]>::to_vec)
                .unwrap_or_default(),
        }
    }
}
