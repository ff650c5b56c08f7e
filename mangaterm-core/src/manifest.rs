use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{ReaderError, ReaderResult};
use crate::page::PageDescriptor;
use crate::ChapterId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterManifest {
    pub base_url: String,
    pub hash: String,
    pub page_files: Vec<String>,
}

impl ChapterManifest {
    pub fn page_url(&self, file: &str) -> String {
        format!(
            "{}/data/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.hash,
            file
        )
    }

    pub fn seed_pages(&self) -> Vec<PageDescriptor> {
        self.page_files
            .iter()
            .enumerate()
            .map(|(index, file)| PageDescriptor::pending(index, self.page_url(file)))
            .collect()
    }

    pub fn page_count(&self) -> usize {
        self.page_files.len()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtHomeResponse {
    pub base_url: String,
    pub chapter: AtHomeChapter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AtHomeChapter {
    pub hash: String,
    pub data: Vec<String>,
}

impl From<AtHomeResponse> for ChapterManifest {
    fn from(response: AtHomeResponse) -> Self {
        Self {
            base_url: response.base_url,
            hash: response.chapter.hash,
            page_files: response.chapter.data,
        }
    }
}

#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, chapter: ChapterId) -> Result<ChapterManifest>;
}

#[derive(Debug, Clone)]
pub struct ResolvedChapter {
    pub chapter: ChapterId,
    pub manifest: ChapterManifest,
    pub pages: Vec<PageDescriptor>,
}

pub struct ManifestResolver<S> {
    source: S,
}

impl<S: ManifestSource> ManifestResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetches the manifest once. Failure leaves nothing behind for the caller
    /// to render.
    #[instrument(skip(self))]
    pub async fn resolve(&self, chapter: ChapterId) -> ReaderResult<ResolvedChapter> {
        let manifest = match self.source.fetch_manifest(chapter).await {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(?err, %chapter, "manifest fetch failed");
                return Err(ReaderError::ManifestUnavailable {
                    chapter: chapter.to_string(),
                    reason: format!("{err:#}"),
                });
            }
        };
        if manifest.base_url.trim().is_empty() || manifest.hash.trim().is_empty() {
            return Err(ReaderError::ManifestUnavailable {
                chapter: chapter.to_string(),
                reason: "manifest is missing its base url or hash".into(),
            });
        }

        let pages = manifest.seed_pages();
        info!(%chapter, pages = pages.len(), "chapter manifest resolved");
        Ok(ResolvedChapter {
            chapter,
            manifest,
            pages,
        })
    }
}
