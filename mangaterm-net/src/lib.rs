use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::ImageReader;
use mangaterm_core::catalog::{
    group_tags, ChapterSummary, Envelope, LIST_PAGE_SIZE, SEARCH_PAGE_SIZE,
};
use mangaterm_core::config::ApiConfig;
use mangaterm_core::manifest::AtHomeResponse;
use mangaterm_core::{
    ChapterId, ChapterManifest, FeedPage, FeedRequest, ListRequest, MangaId, MangaPage,
    MangaSummary, ManifestSource, RenderImage, SearchRequest, SizeProbe, Tag,
};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

#[derive(Clone)]
pub struct MangaDexClient {
    http: reqwest::Client,
    base: Url,
    uploads_url: String,
}

impl MangaDexClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .context("failed to build http client")?;
        Self::with_http(http, config)
    }

    pub fn with_http(http: reqwest::Client, config: &ApiConfig) -> Result<Self> {
        let mut base = config.base_url.trim_end_matches('/').to_owned();
        base.push('/');
        let base =
            Url::parse(&base).with_context(|| format!("invalid api url {:?}", config.base_url))?;
        Ok(Self {
            http,
            base,
            uploads_url: config.uploads_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid endpoint path {path:?}"))
    }

    pub fn manifest_url(&self, chapter: ChapterId) -> Result<Url> {
        self.endpoint(&format!("at-home/server/{chapter}"))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(String, String)]) -> Result<T> {
        debug!(%url, "GET");
        let response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode response from {url}"))
    }

    #[instrument(skip(self))]
    pub async fn manga(&self, manga: MangaId) -> Result<MangaSummary> {
        let url = self.endpoint(&format!("manga/{manga}"))?;
        let query = [("includes[]".to_owned(), "cover_art".to_owned())];
        let envelope: Envelope<MangaSummary> = self.get_json(url, &query).await?;
        Ok(envelope.data)
    }

    #[instrument(skip(self, request), fields(manga = %request.manga, page = request.page))]
    pub async fn chapter_feed(&self, request: &FeedRequest) -> Result<FeedPage> {
        let url = self.endpoint(&request.path())?;
        let envelope: Envelope<Vec<ChapterSummary>> =
            self.get_json(url, &request.query()).await?;
        Ok(FeedPage::from_response(envelope.data))
    }

    #[instrument(skip(self))]
    pub async fn tags(&self) -> Result<BTreeMap<String, Vec<Tag>>> {
        let url = self.endpoint("manga/tag")?;
        let envelope: Envelope<Vec<Tag>> = self.get_json(url, &[]).await?;
        Ok(group_tags(envelope.data))
    }

    #[instrument(skip(self, request), fields(title = ?request.title, page = request.page))]
    pub async fn search(&self, request: &SearchRequest) -> Result<MangaPage> {
        let url = self.endpoint(request.path())?;
        let envelope: Envelope<Vec<MangaSummary>> = self.get_json(url, &request.query()).await?;
        Ok(MangaPage::from_response(envelope.data, SEARCH_PAGE_SIZE))
    }

    #[instrument(skip(self, request), fields(kind = ?request.kind, page = request.page))]
    pub async fn list(&self, request: &ListRequest) -> Result<MangaPage> {
        let url = self.endpoint(request.path())?;
        let envelope: Envelope<Vec<MangaSummary>> = self.get_json(url, &request.query()).await?;
        Ok(MangaPage::from_response(envelope.data, LIST_PAGE_SIZE))
    }

    pub fn cover_url(&self, manga: &MangaSummary) -> String {
        manga.cover_url(&self.uploads_url)
    }
}

#[async_trait]
impl ManifestSource for MangaDexClient {
    #[instrument(skip(self))]
    async fn fetch_manifest(&self, chapter: ChapterId) -> Result<ChapterManifest> {
        let url = self.manifest_url(chapter)?;
        let response: AtHomeResponse = self.get_json(url, &[]).await?;
        Ok(response.into())
    }
}

#[derive(Clone)]
pub struct HttpImageFetcher {
    http: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .context("failed to build http client")?;
        Ok(Self::new(http))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self))]
    pub async fn fetch_page(&self, url: &str) -> Result<RenderImage> {
        let bytes = self.download(url).await?;
        tokio::task::spawn_blocking(move || decode_rgba(&bytes))
            .await
            .map_err(|err| anyhow!("decode task failed: {err}"))?
    }
}

#[async_trait]
impl SizeProbe for HttpImageFetcher {
    async fn probe_size(&self, url: &str) -> Result<(u32, u32)> {
        let bytes = self.download(url).await?;
        decode_dimensions(&bytes).with_context(|| format!("failed to read size of {url}"))
    }
}

pub fn decode_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    if reader.format().is_none() {
        return Err(anyhow!("unrecognized image format"));
    }
    Ok(reader.into_dimensions()?)
}

pub fn decode_rgba(bytes: &[u8]) -> Result<RenderImage> {
    let image = image::load_from_memory(bytes)
        .context("failed to decode page image")?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok(RenderImage {
        width,
        height,
        pixels: image.into_raw(),
    })
}
