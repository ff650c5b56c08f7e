use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{ChapterSummary, MangaSummary};
use crate::error::{ReaderError, ReaderResult};
use crate::store::KeyValueStore;
use crate::{ChapterId, MangaId};

const FAVORITES_KEY: &str = "favorites";
const SAVED_IMAGES_KEY: &str = "savedImages";

fn last_read_key(manga: MangaId) -> String {
    format!("lastReadChapter_{manga}")
}

fn read_chapters_key(manga: MangaId) -> String {
    format!("readChapters_{manga}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedImage {
    pub uri: String,
    pub dimensions: ImageDimensions,
}

pub struct Library {
    store: Arc<dyn KeyValueStore>,
}

impl Library {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> ReaderResult<Option<T>> {
        let Some(raw) = self
            .store
            .get(key)
            .map_err(|err| ReaderError::storage(key, format!("{err:#}")))?
        else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(key, %err, "discarding undecodable library entry");
                Ok(None)
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T) -> ReaderResult<()> {
        let payload = serde_json::to_string(value).map_err(|err| ReaderError::storage(key, err))?;
        self.store
            .set(key, &payload)
            .map_err(|err| ReaderError::storage(key, format!("{err:#}")))
    }

    pub fn favorites(&self) -> ReaderResult<Vec<MangaSummary>> {
        Ok(self.read(FAVORITES_KEY)?.unwrap_or_default())
    }

    pub fn is_favorite(&self, manga: MangaId) -> ReaderResult<bool> {
        Ok(self.favorites()?.iter().any(|m| m.id == manga))
    }

    pub fn add_favorite(&self, manga: &MangaSummary) -> ReaderResult<bool> {
        let mut favorites = self.favorites()?;
        if favorites.iter().any(|m| m.id == manga.id) {
            return Ok(false);
        }
        favorites.push(manga.clone());
        self.write(FAVORITES_KEY, &favorites)?;
        Ok(true)
    }

    pub fn remove_favorite(&self, manga: MangaId) -> ReaderResult<bool> {
        let mut favorites = self.favorites()?;
        let before = favorites.len();
        favorites.retain(|m| m.id != manga);
        if favorites.len() == before {
            return Ok(false);
        }
        self.write(FAVORITES_KEY, &favorites)?;
        Ok(true)
    }

    pub fn toggle_favorite(&self, manga: &MangaSummary) -> ReaderResult<bool> {
        if self.is_favorite(manga.id)? {
            self.remove_favorite(manga.id)?;
            Ok(false)
        } else {
            self.add_favorite(manga)?;
            Ok(true)
        }
    }

    pub fn last_read(&self, manga: MangaId) -> ReaderResult<Option<ChapterSummary>> {
        self.read(&last_read_key(manga))
    }

    pub fn read_chapters(&self, manga: MangaId) -> ReaderResult<Vec<ChapterId>> {
        Ok(self.read(&read_chapters_key(manga))?.unwrap_or_default())
    }

    pub fn is_read(&self, manga: MangaId, chapter: ChapterId) -> ReaderResult<bool> {
        Ok(self.read_chapters(manga)?.contains(&chapter))
    }

    pub fn mark_read(&self, manga: MangaId, chapter: &ChapterSummary) -> ReaderResult<()> {
        self.write(&last_read_key(manga), chapter)?;
        let mut read = self.read_chapters(manga)?;
        if !read.contains(&chapter.id) {
            read.push(chapter.id);
            self.write(&read_chapters_key(manga), &read)?;
        }
        Ok(())
    }

    pub fn saved_images(&self) -> ReaderResult<Vec<SavedImage>> {
        Ok(self.read(SAVED_IMAGES_KEY)?.unwrap_or_default())
    }

    /// Keeps `image` in the gallery. Returns `false` when an image with the same
    /// URI is already saved.
    pub fn save_image(&self, image: SavedImage) -> ReaderResult<bool> {
        let mut images = self.saved_images()?;
        if images.iter().any(|saved| saved.uri == image.uri) {
            return Ok(false);
        }
        images.push(image);
        self.write(SAVED_IMAGES_KEY, &images)?;
        Ok(true)
    }

    pub fn remove_image(&self, uri: &str) -> ReaderResult<bool> {
        let mut images = self.saved_images()?;
        let before = images.len();
        images.retain(|saved| saved.uri != uri);
        if images.len() == before {
            return Ok(false);
        }
        self.write(SAVED_IMAGES_KEY, &images)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChapterAttributes, MangaAttributes};
    use crate::store::MemoryKeyValueStore;
    use anyhow::{anyhow, Result};
    use uuid::Uuid;

    fn library() -> (Arc<MemoryKeyValueStore>, Library) {
        let store = Arc::new(MemoryKeyValueStore::new());
        (store.clone(), Library::new(store))
    }

    fn manga() -> MangaSummary {
        MangaSummary {
            id: Uuid::new_v4(),
            attributes: MangaAttributes::default(),
            relationships: vec![],
        }
    }

    fn chapter(number: &str) -> ChapterSummary {
        ChapterSummary {
            id: Uuid::new_v4(),
            attributes: ChapterAttributes {
                chapter: Some(number.into()),
                pages: 18,
                ..Default::default()
            },
        }
    }

    #[test]
    fn favorites_toggle() {
        let (_, library) = library();
        let first = manga();
        assert!(!library.is_favorite(first.id).unwrap());
        assert!(library.toggle_favorite(&first).unwrap());
        assert!(!library.add_favorite(&first).unwrap());
        assert_eq!(library.favorites().unwrap().len(), 1);
        assert!(!library.toggle_favorite(&first).unwrap());
        assert!(library.favorites().unwrap().is_empty());
    }

    #[test]
    fn reading_progress_uses_per_manga_keys() {
        let (store, library) = library();
        let series = Uuid::new_v4();
        let one = chapter("1");
        let two = chapter("2");

        library.mark_read(series, &one).unwrap();
        library.mark_read(series, &two).unwrap();
        library.mark_read(series, &one).unwrap();

        assert_eq!(library.last_read(series).unwrap(), Some(one.clone()));
        assert_eq!(library.read_chapters(series).unwrap(), vec![one.id, two.id]);
        assert!(library.is_read(series, two.id).unwrap());
        assert!(store
            .get(&format!("lastReadChapter_{series}"))
            .unwrap()
            .is_some());
        assert!(library.read_chapters(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn saved_images_dedupe_by_uri() {
        let (_, library) = library();
        let image = SavedImage {
            uri: "https://node/data/h/1.png".into(),
            dimensions: ImageDimensions {
                width: 800,
                height: 1200,
            },
        };
        assert!(library.save_image(image.clone()).unwrap());
        assert!(!library.save_image(image.clone()).unwrap());
        assert_eq!(library.saved_images().unwrap(), vec![image.clone()]);
        assert!(library.remove_image(&image.uri).unwrap());
        assert!(!library.remove_image(&image.uri).unwrap());
    }

    #[test]
    fn corrupt_entries_read_as_empty() {
        let (store, library) = library();
        store.set("savedImages", "{not json").unwrap();
        assert!(library.saved_images().unwrap().is_empty());
    }

    #[test]
    fn store_failures_surface_as_storage_unavailable() {
        struct BrokenStore;

        impl KeyValueStore for BrokenStore {
            fn get(&self, _key: &str) -> Result<Option<String>> {
                Err(anyhow!("disk full"))
            }

            fn set(&self, _key: &str, _value: &str) -> Result<()> {
                Err(anyhow!("disk full"))
            }
        }

        let library = Library::new(Arc::new(BrokenStore));
        let err = library.favorites().unwrap_err();
        assert!(matches!(err, ReaderError::StorageUnavailable { .. }));
        assert!(!err.is_fatal());
    }
}
