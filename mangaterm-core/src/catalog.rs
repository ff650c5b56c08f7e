//! Catalog records returned by the manga API and the helpers the reader needs
//! from them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ChapterId, MangaId};

pub const FEED_PAGE_SIZE: usize = 40;
pub const SEARCH_PAGE_SIZE: usize = 15;
pub const LIST_PAGE_SIZE: usize = 10;

pub const PLACEHOLDER_COVER: &str = "https://via.placeholder.com/100x150?text=No+Image";

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MangaSummary {
    pub id: MangaId,
    #[serde(default)]
    pub attributes: MangaAttributes,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MangaAttributes {
    pub title: BTreeMap<String, String>,
    pub description: BTreeMap<String, String>,
    pub year: Option<u32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<RelationshipAttributes>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl MangaSummary {
    pub fn title(&self) -> &str {
        localized(&self.attributes.title).unwrap_or("Untitled")
    }

    pub fn description(&self) -> Option<&str> {
        localized(&self.attributes.description)
    }

    fn cover_file(&self) -> Option<&str> {
        self.relationships
            .iter()
            .find(|rel| rel.kind == "cover_art")
            .and_then(|rel| rel.attributes.as_ref())
            .and_then(|attrs| attrs.file_name.as_deref())
    }

    /// `{uploads}/covers/{mangaId}/{fileName}`, or a placeholder when the
    /// manga has no cover art relationship.
    pub fn cover_url(&self, uploads_url: &str) -> String {
        match self.cover_file() {
            Some(file) => format!(
                "{}/covers/{}/{}",
                uploads_url.trim_end_matches('/'),
                self.id,
                file
            ),
            None => PLACEHOLDER_COVER.to_owned(),
        }
    }
}

fn localized(values: &BTreeMap<String, String>) -> Option<&str> {
    values
        .get("en")
        .or_else(|| values.values().next())
        .map(String::as_str)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub id: ChapterId,
    #[serde(default)]
    pub attributes: ChapterAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ChapterAttributes {
    pub volume: Option<String>,
    pub chapter: Option<String>,
    pub title: Option<String>,
    pub translated_language: Option<String>,
    pub pages: i64,
    pub publish_at: Option<String>,
}

impl ChapterSummary {
    pub fn label(&self) -> String {
        let number = self.attributes.chapter.as_deref().unwrap_or("?");
        match self.attributes.title.as_deref().filter(|t| !t.is_empty()) {
            Some(title) => format!("Chapter {number}: {title}"),
            None => format!("Chapter {number}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub manga: MangaId,
    pub languages: Vec<String>,
    /// 1-based page number.
    pub page: usize,
}

impl FeedRequest {
    pub fn path(&self) -> String {
        format!("manga/{}/feed", self.manga)
    }

    pub fn query(&self) -> Vec<(String, String)> {
        let mut query = vec![("order[chapter]".to_owned(), "desc".to_owned())];
        query.extend(
            self.languages
                .iter()
                .map(|lang| ("translatedLanguage[]".to_owned(), lang.clone())),
        );
        query.push(("limit".to_owned(), FEED_PAGE_SIZE.to_string()));
        let offset = self.page.saturating_sub(1) * FEED_PAGE_SIZE;
        query.push(("offset".to_owned(), offset.to_string()));
        query
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub chapters: Vec<ChapterSummary>,
    pub has_more: bool,
}

impl FeedPage {
    pub fn from_response(chapters: Vec<ChapterSummary>) -> Self {
        let chapters: Vec<_> = chapters
            .into_iter()
            .filter(|chapter| chapter.attributes.pages >= 0)
            .collect();
        let has_more = chapters.len() >= FEED_PAGE_SIZE;
        Self { chapters, has_more }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(default)]
    pub attributes: TagAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TagAttributes {
    pub name: BTreeMap<String, String>,
    pub group: Option<String>,
}

impl Tag {
    pub fn name(&self) -> &str {
        localized(&self.attributes.name).unwrap_or("Unnamed")
    }

    pub fn group(&self) -> &str {
        self.attributes
            .group
            .as_deref()
            .filter(|group| !group.is_empty())
            .unwrap_or("Other")
    }
}

pub fn group_tags(tags: Vec<Tag>) -> BTreeMap<String, Vec<Tag>> {
    let mut groups: BTreeMap<String, Vec<Tag>> = BTreeMap::new();
    for tag in tags {
        groups.entry(tag.group().to_owned()).or_default().push(tag);
    }
    for tags in groups.values_mut() {
        tags.sort_by(|a, b| a.name().cmp(b.name()));
    }
    groups
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Rating,
    FollowedCount,
    LatestUploadedChapter,
    CreatedAt,
}

impl SortField {
    fn key(self) -> &'static str {
        match self {
            SortField::Rating => "order[rating]",
            SortField::FollowedCount => "order[followedCount]",
            SortField::LatestUploadedChapter => "order[latestUploadedChapter]",
            SortField::CreatedAt => "order[createdAt]",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "rating" => Ok(SortField::Rating),
            "follows" | "followedCount" => Ok(SortField::FollowedCount),
            "latest" | "latestUploadedChapter" => Ok(SortField::LatestUploadedChapter),
            "created" | "createdAt" => Ok(SortField::CreatedAt),
            other => Err(format!(
                "unknown sort field {other:?} (expected rating, follows, latest or created)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        })
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(format!("unknown sort direction {other:?}")),
        }
    }
}

fn content_ratings(adult: bool) -> impl Iterator<Item = (String, String)> {
    let mut ratings = vec!["safe", "suggestive"];
    if adult {
        ratings.push("erotica");
    }
    ratings
        .into_iter()
        .map(|rating| ("contentRating[]".to_owned(), rating.to_owned()))
}

fn page_offset(page: usize, page_size: usize) -> String {
    (page.saturating_sub(1) * page_size).to_string()
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub title: Option<String>,
    pub included_tags: Vec<String>,
    pub excluded_tags: Vec<String>,
    pub order: Option<(SortField, SortDirection)>,
    pub adult_content: bool,
    pub page: usize,
}

impl SearchRequest {
    pub fn path(&self) -> &'static str {
        "manga"
    }

    pub fn query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(title) = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            query.push(("title".to_owned(), title.to_owned()));
        }
        query.push(("limit".to_owned(), SEARCH_PAGE_SIZE.to_string()));
        query.push(("offset".to_owned(), page_offset(self.page, SEARCH_PAGE_SIZE)));
        query.push(("includes[]".to_owned(), "cover_art".to_owned()));
        query.extend(content_ratings(self.adult_content));
        if !self.included_tags.is_empty() {
            query.extend(
                self.included_tags
                    .iter()
                    .map(|tag| ("includedTags[]".to_owned(), tag.clone())),
            );
            query.push(("includedTagsMode".to_owned(), "AND".to_owned()));
        }
        if !self.excluded_tags.is_empty() {
            query.extend(
                self.excluded_tags
                    .iter()
                    .map(|tag| ("excludedTags[]".to_owned(), tag.clone())),
            );
            query.push(("excludedTagsMode".to_owned(), "OR".to_owned()));
        }
        if let Some((field, direction)) = self.order {
            query.push((field.key().to_owned(), direction.to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Popular,
    TopRated,
    LatestUploads,
}

impl ListKind {
    fn order(self) -> SortField {
        match self {
            ListKind::Popular => SortField::FollowedCount,
            ListKind::TopRated => SortField::Rating,
            ListKind::LatestUploads => SortField::LatestUploadedChapter,
        }
    }
}

impl FromStr for ListKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "popular" => Ok(ListKind::Popular),
            "top-rated" => Ok(ListKind::TopRated),
            "latest" => Ok(ListKind::LatestUploads),
            other => Err(format!(
                "unknown list {other:?} (expected popular, top-rated or latest)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ListRequest {
    pub kind: ListKind,
    pub page: usize,
}

impl ListRequest {
    pub fn path(&self) -> &'static str {
        "manga"
    }

    pub fn query(&self) -> Vec<(String, String)> {
        vec![
            (self.kind.order().key().to_owned(), SortDirection::Desc.to_string()),
            ("limit".to_owned(), LIST_PAGE_SIZE.to_string()),
            ("offset".to_owned(), page_offset(self.page, LIST_PAGE_SIZE)),
            ("includes[]".to_owned(), "cover_art".to_owned()),
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct MangaPage {
    pub manga: Vec<MangaSummary>,
    pub has_more: bool,
}

impl MangaPage {
    pub fn from_response(manga: Vec<MangaSummary>, page_size: usize) -> Self {
        let has_more = manga.len() >= page_size;
        Self { manga, has_more }
    }
}
