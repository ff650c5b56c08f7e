use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use mangaterm_core::{
    ChapterSession, ChapterSummary, DimensionResolver, DimensionUpdate, FeedRequest,
    FileKeyValueStore, ImageDimensions, KeyValueStore, Library, ListKind, ListRequest, MangaPage,
    MangaSummary, ManifestResolver, MountedPage, PageStatus, ReaderCommand, ReaderConfig,
    ReaderError, ReaderEvent, RenderImage, SavedImage, SearchRequest, SessionToken, SortDirection,
    SortField, Tag, Viewport,
};
use mangaterm_net::{HttpImageFetcher, MangaDexClient};
use mangaterm_tty::{
    write_status_line, CellSize, DrawParams, EventMapper, KittyRenderer, UiEvent,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "mangaterm",
    version,
    about = "kitty-native long-strip chapter reader"
)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a chapter in the page view
    Read(ReadArgs),
    /// List catalog tags by group
    Tags,
    /// Search the catalog by title and tags
    Search(SearchArgs),
    /// Show a curated catalog list
    List {
        /// popular, top-rated or latest
        kind: ListKind,
        #[arg(long = "page", default_value_t = 1)]
        page: usize,
    },
    /// Show the last chapter read in a series
    LastRead { manga: Uuid },
    /// List favorite series
    Favorites,
    /// Manage saved page images
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
}

#[derive(Debug, Subcommand)]
enum SavedAction {
    List,
    Remove { uri: String },
}

#[derive(Debug, clap::Args)]
struct SearchArgs {
    title: Option<String>,

    /// Tag id every result must carry; repeatable
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Tag id no result may carry; repeatable
    #[arg(long = "exclude-tag")]
    excluded_tags: Vec<String>,

    /// rating, follows, latest or created
    #[arg(long = "order")]
    order: Option<SortField>,

    #[arg(long = "direction", default_value = "desc")]
    direction: SortDirection,

    #[arg(long = "page", default_value_t = 1)]
    page: usize,
}

#[derive(Debug, clap::Args)]
struct ReadArgs {
    /// Chapter to open
    chapter: Uuid,

    /// Series the chapter belongs to; enables favorites and reading progress
    #[arg(short = 'm', long = "manga")]
    manga: Option<Uuid>,

    /// Page to start on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Maximum number of pages probed at once
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// Width of the scrub lane in terminal columns
    #[arg(long = "lane-columns")]
    lane_columns: Option<u16>,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, EnableMouseCapture, cursor::Hide)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture, cursor::Show);
        let _ = terminal::disable_raw_mode();
    }
}

type ImageResult = (SessionToken, usize, Result<RenderImage>);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ReaderConfig::project_dirs()
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args.config.clone().or_else(ReaderConfig::default_path);
    let mut config = match &config_path {
        Some(path) => ReaderConfig::load(path)?,
        None => ReaderConfig::default(),
    };
    if let Command::Read(read) = &args.command {
        if let Some(concurrency) = read.concurrency {
            config.pipeline.probe_concurrency = concurrency;
        }
        if let Some(lane_columns) = read.lane_columns {
            config.scrub.lane_columns = lane_columns;
        }
    }
    config.validate()?;

    let data_dir = config
        .library
        .data_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().to_path_buf());
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileKeyValueStore::new(data_dir.join("library"))?);
    let library = Library::new(store);

    let client = MangaDexClient::new(&config.api)?;
    match args.command {
        Command::Read(read) => read_chapter(read, &config, &library, client).await,
        Command::Tags => {
            let groups = client.tags().await?;
            print_lines(tag_lines(&groups));
            Ok(())
        }
        Command::Search(search) => {
            let request = search_request(search, &config);
            let page = client.search(&request).await?;
            print_lines(manga_lines(&page, request.page));
            Ok(())
        }
        Command::List { kind, page } => {
            let results = client.list(&ListRequest { kind, page }).await?;
            print_lines(manga_lines(&results, page));
            Ok(())
        }
        Command::LastRead { manga } => {
            println!("{}", last_read_line(library.last_read(manga)?.as_ref()));
            Ok(())
        }
        Command::Favorites => {
            let favorites = library.favorites()?;
            if favorites.is_empty() {
                println!("no favorites");
            }
            for manga in favorites {
                println!("{}  {}", manga.id, manga.title());
            }
            Ok(())
        }
        Command::Saved { action } => {
            match action {
                SavedAction::List => print_lines(saved_lines(&library.saved_images()?)),
                SavedAction::Remove { uri } => {
                    if library.remove_image(&uri)? {
                        println!("removed {uri}");
                    } else {
                        println!("{uri} was not saved");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn read_chapter(
    args: ReadArgs,
    config: &ReaderConfig,
    library: &Library,
    client: MangaDexClient,
) -> Result<()> {
    let fetcher = HttpImageFetcher::from_config(&config.api)?;
    let manga = match args.manga {
        Some(id) => load_series(&client, library, config, id, args.chapter).await,
        None => None,
    };

    let screen = Screen::query()?;
    let resolver = ManifestResolver::new(client);
    let mut session = ChapterSession::open(
        &resolver,
        args.chapter,
        screen.viewport(),
        config.window,
        screen.lane_width(config.scrub.lane_columns),
    )
    .await
    .with_context(|| format!("could not open chapter {}", args.chapter))?;

    let (dim_tx, mut dim_rx) = mpsc::unbounded_channel::<Vec<DimensionUpdate>>();
    let probe = DimensionResolver::from_config(fetcher.clone(), &config.pipeline);
    let token = session.token();
    let requests = session.pending_requests();
    tokio::spawn(async move {
        let summary = probe.stream(token, requests, dim_tx).await;
        info!(
            resolved = summary.resolved,
            failed = summary.failed,
            batches = summary.batches,
            "dimension probing finished"
        );
    });

    let (image_tx, mut image_rx) = mpsc::unbounded_channel::<ImageResult>();
    let mut images = PageImages::default();

    if let Some(page) = args.page {
        session.apply(ReaderCommand::GotoPage {
            page: page.saturating_sub(1),
        });
    }

    let _raw = RawModeGuard::new()?;
    let mut renderer = KittyRenderer::new(io::stdout());
    let mut event_mapper = EventMapper::new();
    event_mapper.set_screen(screen.cell, screen.page_rows());
    let mut screen = screen;
    let mut notice: Option<String> = None;
    let mut dirty = true;
    let events = session.events();

    loop {
        while let Ok(batch) = dim_rx.try_recv() {
            session.apply_dimensions(&batch);
        }
        while let Ok((session_token, index, result)) = image_rx.try_recv() {
            if images.receive(&session, session_token, index, result) {
                dirty = true;
            }
        }
        let pending_events: Vec<ReaderEvent> = events.lock().drain(..).collect();
        for reader_event in pending_events {
            match reader_event {
                ReaderEvent::WindowChanged { session: t, change } if t == session.token() => {
                    for index in change.unmounted {
                        images.release(index);
                    }
                    for index in change.mounted {
                        images.request(&session, index, &fetcher, &image_tx);
                    }
                    dirty = true;
                }
                ReaderEvent::RedrawNeeded(t) if t == session.token() => dirty = true,
                ReaderEvent::PageSettled { .. } => dirty = true,
                _ => {}
            }
        }

        if dirty {
            redraw(
                &mut renderer,
                &session,
                &images,
                &screen,
                config.scrub.lane_columns,
                event_mapper.pending_input().as_deref(),
                notice.as_deref(),
            )?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(50))? {
            let pending_before = event_mapper.pending_input();
            let ui_event = event_mapper.map_event(event::read()?);
            match ui_event {
                UiEvent::Command(command) => session.apply(command),
                UiEvent::Gesture(gesture) => {
                    session.handle_gesture(gesture);
                }
                UiEvent::Resize { .. } => {
                    screen = Screen::query()?;
                    event_mapper.set_screen(screen.cell, screen.page_rows());
                    session.set_viewport(screen.viewport());
                    renderer.clear_all()?;
                }
                UiEvent::SaveImage => {
                    notice = Some(save_current_page(library, &session));
                    dirty = true;
                }
                UiEvent::ToggleFavorite => {
                    notice = Some(toggle_favorite(library, manga.as_ref()));
                    dirty = true;
                }
                UiEvent::Quit => break,
                UiEvent::None => {}
            }
            if event_mapper.pending_input() != pending_before {
                dirty = true;
            }
        }
    }

    renderer.begin_frame()?;
    renderer.clear_all()?;
    Ok(())
}

/// Looks up the series and records the chapter as read. Failures only cost
/// the library features.
async fn load_series(
    client: &MangaDexClient,
    library: &Library,
    config: &ReaderConfig,
    manga: Uuid,
    chapter: Uuid,
) -> Option<MangaSummary> {
    let summary = match client.manga(manga).await {
        Ok(summary) => summary,
        Err(err) => {
            warn!(%manga, ?err, "failed to load series details");
            return None;
        }
    };
    info!(title = summary.title(), "reading series");

    let mut page = 1;
    loop {
        let request = FeedRequest {
            manga,
            languages: config.api.languages.clone(),
            page,
        };
        let feed = match client.chapter_feed(&request).await {
            Ok(feed) => feed,
            Err(err) => {
                warn!(%manga, page, ?err, "failed to load chapter feed");
                break;
            }
        };
        if let Some(entry) = feed.chapters.iter().find(|c| c.id == chapter) {
            if let Err(err) = library.mark_read(manga, entry) {
                warn!(%err, "failed to record reading progress");
            }
            break;
        }
        if !feed.has_more {
            break;
        }
        page += 1;
    }
    Some(summary)
}

fn search_request(args: SearchArgs, config: &ReaderConfig) -> SearchRequest {
    SearchRequest {
        title: args.title,
        included_tags: args.tags,
        excluded_tags: args.excluded_tags,
        order: args.order.map(|field| (field, args.direction)),
        adult_content: config.api.adult_content,
        page: args.page.max(1),
    }
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

fn tag_lines(groups: &BTreeMap<String, Vec<Tag>>) -> Vec<String> {
    let mut lines = Vec::new();
    for (group, tags) in groups {
        lines.push(format!("{group}:"));
        lines.extend(tags.iter().map(|tag| format!("  {}  {}", tag.id, tag.name())));
    }
    lines
}

fn manga_lines(results: &MangaPage, page: usize) -> Vec<String> {
    if results.manga.is_empty() {
        return vec!["no results".into()];
    }
    let mut lines: Vec<String> = results
        .manga
        .iter()
        .map(|manga| match manga.attributes.year {
            Some(year) => format!("{}  {} ({year})", manga.id, manga.title()),
            None => format!("{}  {}", manga.id, manga.title()),
        })
        .collect();
    if results.has_more {
        lines.push(format!("more results with --page {}", page + 1));
    }
    lines
}

fn last_read_line(chapter: Option<&ChapterSummary>) -> String {
    match chapter {
        Some(chapter) => format!("{}  {}", chapter.id, chapter.label()),
        None => "no chapters read".into(),
    }
}

fn saved_lines(images: &[SavedImage]) -> Vec<String> {
    if images.is_empty() {
        return vec!["no saved images".into()];
    }
    images
        .iter()
        .map(|image| {
            format!(
                "{}  {}x{}",
                image.uri, image.dimensions.width, image.dimensions.height
            )
        })
        .collect()
}

fn save_current_page(library: &Library, session: &ChapterSession) -> String {
    let Some(index) = session.current_page() else {
        return "nothing to save".into();
    };
    let Some(page) = session.pages().get(index) else {
        return "nothing to save".into();
    };
    let PageStatus::Resolved { width, height } = page.status else {
        return format!("page {} has no size yet", index + 1);
    };
    let image = SavedImage {
        uri: page.url.clone(),
        dimensions: ImageDimensions { width, height },
    };
    match library.save_image(image) {
        Ok(true) => format!("saved page {}", index + 1),
        Ok(false) => format!("page {} already saved", index + 1),
        Err(err) => storage_notice(err),
    }
}

fn toggle_favorite(library: &Library, manga: Option<&MangaSummary>) -> String {
    let Some(manga) = manga else {
        return "favorites need --manga".into();
    };
    match library.toggle_favorite(manga) {
        Ok(true) => format!("added {} to favorites", manga.title()),
        Ok(false) => format!("removed {} from favorites", manga.title()),
        Err(err) => storage_notice(err),
    }
}

fn storage_notice(err: ReaderError) -> String {
    warn!(%err, "library write failed");
    format!("library unavailable: {err}")
}

#[derive(Default)]
struct PageImages {
    ready: HashMap<usize, RenderImage>,
    in_flight: HashSet<usize>,
    failed: HashSet<usize>,
}

impl PageImages {
    fn request(
        &mut self,
        session: &ChapterSession,
        index: usize,
        fetcher: &HttpImageFetcher,
        results: &mpsc::UnboundedSender<ImageResult>,
    ) {
        if self.ready.contains_key(&index) || !self.in_flight.insert(index) {
            return;
        }
        let Some(page) = session.pages().get(index) else {
            self.in_flight.remove(&index);
            return;
        };
        let url = page.url.clone();
        let token = session.token();
        let fetcher = fetcher.clone();
        let results = results.clone();
        tokio::spawn(async move {
            let result = fetcher.fetch_page(&url).await;
            let _ = results.send((token, index, result));
        });
    }

    /// Stores a finished download if its page is still mounted in the same
    /// session. Returns whether the frame changed.
    fn receive(
        &mut self,
        session: &ChapterSession,
        token: SessionToken,
        index: usize,
        result: Result<RenderImage>,
    ) -> bool {
        self.in_flight.remove(&index);
        if token != session.token() || !session.is_mounted(index) {
            return false;
        }
        match result {
            Ok(image) => {
                self.ready.insert(index, image);
            }
            Err(err) => {
                warn!(index, ?err, "failed to load page image");
                self.failed.insert(index);
            }
        }
        true
    }

    fn release(&mut self, index: usize) {
        self.ready.remove(&index);
        self.failed.remove(&index);
    }

    fn get(&self, index: usize) -> Option<&RenderImage> {
        self.ready.get(&index)
    }

    fn has_failed(&self, index: usize) -> bool {
        self.failed.contains(&index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Screen {
    columns: u16,
    rows: u16,
    cell: CellSize,
}

impl Screen {
    fn query() -> Result<Self> {
        let size = terminal::window_size()?;
        Ok(Self::from_size(size.columns, size.rows, size.width, size.height))
    }

    fn from_size(columns: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        let columns = columns.max(1);
        let rows = rows.max(2);
        let cell = if pixel_width > 0 && pixel_height > 0 {
            CellSize {
                width: f64::from(pixel_width) / f64::from(columns),
                height: f64::from(pixel_height) / f64::from(rows),
            }
        } else {
            CellSize::default()
        };
        Self {
            columns,
            rows,
            cell,
        }
    }

    fn page_rows(&self) -> u16 {
        self.rows.saturating_sub(1).max(1)
    }

    fn image_columns(&self) -> u16 {
        // Same width the layout uses; the scrub lane is drawn over it.
        self.columns
    }

    fn viewport(&self) -> Viewport {
        Viewport::new(
            f64::from(self.image_columns()) * self.cell.width,
            f64::from(self.page_rows()) * self.cell.height,
        )
    }

    fn lane_width(&self, lane_columns: u16) -> f64 {
        f64::from(lane_columns.min(self.columns)) * self.cell.width
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PageSlice {
    index: usize,
    row: u16,
    rows: u16,
    source_top: f64,
    source_height: f64,
    page_height: f64,
}

fn visible_slices(
    pages: &[MountedPage],
    offset: f64,
    viewport_height: f64,
    cell_height: f64,
) -> Vec<PageSlice> {
    if cell_height <= 0.0 {
        return Vec::new();
    }
    let bottom = offset + viewport_height;
    pages
        .iter()
        .filter(|page| page.height > 0.0 && page.top < bottom && page.top + page.height > offset)
        .map(|page| {
            let visible_top = page.top.max(offset);
            let visible_bottom = (page.top + page.height).min(bottom);
            let row = ((visible_top - offset) / cell_height).floor() as u16;
            let end_row = ((visible_bottom - offset) / cell_height).ceil() as u16;
            PageSlice {
                index: page.index,
                row,
                rows: end_row.saturating_sub(row).max(1),
                source_top: visible_top - page.top,
                source_height: visible_bottom - visible_top,
                page_height: page.height,
            }
        })
        .collect()
}

fn crop_to_slice(image: &RenderImage, slice: &PageSlice) -> RenderImage {
    let scale = f64::from(image.height) / slice.page_height;
    let top = (slice.source_top * scale).floor().max(0.0) as u32;
    let height = (slice.source_height * scale).ceil().max(1.0) as u32;
    image.crop_rows(top, height)
}

fn thumb_row(offset: f64, total_height: f64, page_rows: u16) -> Option<u16> {
    if !(total_height.is_finite() && total_height > 0.0) || page_rows == 0 {
        return None;
    }
    let fraction = (offset / total_height).clamp(0.0, 1.0);
    let row = (fraction * f64::from(page_rows)).floor() as u16;
    Some(row.min(page_rows - 1))
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    session: &ChapterSession,
    images: &PageImages,
    screen: &Screen,
    lane_columns: u16,
    pending_input: Option<&str>,
    notice: Option<&str>,
) -> Result<()> {
    let page_rows = screen.page_rows();
    let lane_columns = lane_columns.min(screen.columns.saturating_sub(1));
    let scroll = session.scroll();
    let viewport = session.viewport();

    renderer.begin_sync_update()?;
    renderer.begin_frame()?;
    {
        let mut writer = renderer.writer();
        crossterm::execute!(&mut writer, Clear(ClearType::All))?;
    }

    let slices = visible_slices(
        &session.mounted_pages(),
        scroll.current_offset,
        viewport.height,
        screen.cell.height,
    );
    for slice in &slices {
        if slice.row >= page_rows {
            continue;
        }
        let rows = slice.rows.min(page_rows - slice.row);
        {
            let mut writer = renderer.writer();
            crossterm::execute!(&mut writer, cursor::MoveTo(0, slice.row))?;
        }
        match images.get(slice.index) {
            Some(image) => {
                let cropped = crop_to_slice(image, slice);
                if cropped.width > 0 && cropped.height > 0 {
                    let params = DrawParams::clamped(
                        u32::from(screen.image_columns()),
                        u32::from(rows),
                    );
                    renderer.draw(&cropped, params)?;
                }
            }
            None => {
                let label = if images.has_failed(slice.index) {
                    format!("page {} failed to load", slice.index + 1)
                } else {
                    format!("loading page {}", slice.index + 1)
                };
                let mut writer = renderer.writer();
                crossterm::execute!(&mut writer, Print(label))?;
            }
        }
    }

    if lane_columns > 0 {
        let lane_col = screen.columns - lane_columns;
        let thumb = thumb_row(scroll.current_offset, scroll.total_height, page_rows);
        let mut writer = renderer.writer();
        for row in 0..page_rows {
            let glyph = if Some(row) == thumb { "█" } else { "│" };
            crossterm::execute!(
                &mut writer,
                cursor::MoveTo(lane_col, row),
                Print(glyph.repeat(usize::from(lane_columns)))
            )?;
        }
    }

    let status = combine_status(session_status(session), pending_input, notice);
    {
        let mut writer = renderer.writer();
        crossterm::execute!(
            &mut writer,
            cursor::MoveTo(0, page_rows),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(&mut writer, &status)?;
    }
    renderer.end_sync_update()?;
    Ok(())
}

fn session_status(session: &ChapterSession) -> String {
    let status = session.status();
    let current = status.current_page.map(|p| p + 1).unwrap_or(0);
    let mut text = format!("page {}/{}", current, status.page_count);
    if status.settled < status.page_count {
        text.push_str(&format!(
            " | sizing {}/{}",
            status.settled, status.page_count
        ));
    }
    if status.failed > 0 {
        text.push_str(&format!(" | {} unreadable", status.failed));
    }
    text
}

fn combine_status(base: String, pending_input: Option<&str>, notice: Option<&str>) -> String {
    let mut status = base;
    for part in [pending_input, notice].into_iter().flatten() {
        if !part.is_empty() {
            status.push_str(" | ");
            status.push_str(part);
        }
    }
    status
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "mangaterm.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // The terminal belongs to the page view, so only errors reach stderr.
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(tracing_subscriber::filter::LevelFilter::ERROR);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
