use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::WindowConfig;
use crate::dimensions::{DimensionUpdate, PageRequest};
use crate::error::ReaderResult;
use crate::layout::PageLayout;
use crate::manifest::{ChapterManifest, ManifestResolver, ManifestSource, ResolvedChapter};
use crate::page::{PageDescriptor, PageStatus, Viewport};
use crate::scrub::{GestureEvent, ScrollCommand, ScrubController, ScrubState};
use crate::window::{MountedPage, ScrollState, WindowChange, WindowRenderer};
use crate::{ChapterId, SessionToken};

#[derive(Debug, Clone, Copy)]
pub enum ReaderCommand {
    ScrollBy { pixels: f64 },
    ScrollScreens { screens: f64 },
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    RedrawNeeded(SessionToken),
    WindowChanged {
        session: SessionToken,
        change: WindowChange,
    },
    PageSettled {
        session: SessionToken,
        index: usize,
        status: PageStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub current_page: Option<usize>,
    pub page_count: usize,
    pub settled: usize,
    pub failed: usize,
}

/// Everything one open chapter view owns. All page, layout and scroll
/// mutation goes through here.
pub struct ChapterSession {
    token: SessionToken,
    chapter: ChapterId,
    manifest: ChapterManifest,
    pages: Vec<PageDescriptor>,
    layout: PageLayout,
    window: WindowRenderer,
    scrub: ScrubController,
    viewport: Viewport,
    pending_target: Option<usize>,
    events: Arc<Mutex<Vec<ReaderEvent>>>,
}

impl ChapterSession {
    pub fn new(
        resolved: ResolvedChapter,
        viewport: Viewport,
        window: WindowConfig,
        lane_width: f64,
    ) -> Self {
        let layout = PageLayout::compute(&resolved.pages, viewport.width);
        let mut session = Self {
            token: Uuid::new_v4(),
            chapter: resolved.chapter,
            manifest: resolved.manifest,
            pages: resolved.pages,
            layout,
            window: WindowRenderer::new(window, viewport.height),
            scrub: ScrubController::new(lane_width),
            viewport,
            pending_target: None,
            events: Arc::new(Mutex::new(Vec::new())),
        };
        let change = session.window.sync(&session.layout);
        session.publish(change);
        session
    }

    /// Resolves the manifest and opens a view over it. On failure no session
    /// exists, so no page sequence is ever visible.
    #[instrument(skip(resolver, viewport, window))]
    pub async fn open<S: ManifestSource>(
        resolver: &ManifestResolver<S>,
        chapter: ChapterId,
        viewport: Viewport,
        window: WindowConfig,
        lane_width: f64,
    ) -> ReaderResult<Self> {
        let resolved = resolver.resolve(chapter).await?;
        let session = Self::new(resolved, viewport, window, lane_width);
        info!(token = %session.token, pages = session.pages.len(), "chapter session opened");
        Ok(session)
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn chapter(&self) -> ChapterId {
        self.chapter
    }

    pub fn manifest(&self) -> &ChapterManifest {
        &self.manifest
    }

    pub fn pages(&self) -> &[PageDescriptor] {
        &self.pages
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn scroll(&self) -> ScrollState {
        self.window.scroll()
    }

    pub fn scrub_state(&self) -> ScrubState {
        self.scrub.state()
    }

    pub fn mounted_pages(&self) -> Vec<MountedPage> {
        self.window.mounted_pages(&self.layout)
    }

    pub fn is_mounted(&self, index: usize) -> bool {
        self.window.is_mounted(index)
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ReaderEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn pending_requests(&self) -> Vec<PageRequest> {
        PageRequest::pending(&self.pages)
    }

    /// Applies settled geometry. Updates addressed to another session, out of
    /// range, or for pages already settled are dropped. Returns how many pages
    /// changed.
    pub fn apply_dimensions(&mut self, updates: &[DimensionUpdate]) -> usize {
        let mut first_changed: Option<usize> = None;
        let mut applied = 0;
        for update in updates {
            if update.session != self.token {
                debug!(stale = %update.session, "dropping update for a closed session");
                continue;
            }
            let Some(page) = self.pages.get_mut(update.index) else {
                continue;
            };
            if !page.settle(update.status) {
                continue;
            }
            applied += 1;
            first_changed = Some(first_changed.map_or(update.index, |i| i.min(update.index)));
            self.events.lock().push(ReaderEvent::PageSettled {
                session: self.token,
                index: update.index,
                status: page.status,
            });
        }

        if let Some(first) = first_changed {
            self.layout.invalidate_from(&self.pages, first);
            let change = self.window.sync(&self.layout);
            self.publish(change);
            if let Some(target) = self.pending_target {
                self.goto_page(target);
            }
            self.redraw();
        }
        applied
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        let anchor = self.anchor();
        self.viewport = viewport;
        self.layout.set_viewport_width(&self.pages, viewport.width);
        self.window.set_viewport_height(viewport.height);
        let anchored = anchor
            .and_then(|(index, within)| {
                self.layout
                    .entry(index)
                    .map(|entry| entry.cumulative_start + within * entry.rendered_height)
            })
            .unwrap_or(0.0);
        let offset = match self.pending_target {
            Some(target) => self.page_offset(target),
            None => anchored,
        };
        let change = self.window.scroll_to(offset, &self.layout);
        self.publish(change);
        self.redraw();
    }

    fn anchor(&self) -> Option<(usize, f64)> {
        let offset = self.window.scroll().current_offset;
        let index = self.layout.page_at_offset(offset)?;
        let entry = self.layout.entry(index)?;
        let within = if entry.rendered_height > 0.0 {
            ((offset - entry.cumulative_start) / entry.rendered_height).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some((index, within))
    }

    pub fn handle_gesture(&mut self, event: GestureEvent) -> Option<ScrollCommand> {
        let command = self
            .scrub
            .handle(event, self.viewport, self.layout.total_height())?;
        self.scroll_to(command.offset);
        Some(command)
    }

    /// Scrolls to `offset`, dropping any page jump still waiting for sizes.
    pub fn scroll_to(&mut self, offset: f64) {
        self.pending_target = None;
        self.move_to(offset);
    }

    fn move_to(&mut self, offset: f64) {
        let before = self.window.scroll().current_offset;
        let change = self.window.scroll_to(offset, &self.layout);
        let moved = self.window.scroll().current_offset != before;
        let changed = !change.is_empty();
        self.publish(change);
        if moved || changed {
            self.redraw();
        }
    }

    pub fn apply(&mut self, command: ReaderCommand) {
        let offset = self.window.scroll().current_offset;
        let last_page = self.pages.len().saturating_sub(1);
        match command {
            ReaderCommand::ScrollBy { pixels } => self.scroll_to(offset + pixels),
            ReaderCommand::ScrollScreens { screens } => {
                self.scroll_to(offset + screens * self.viewport.height)
            }
            ReaderCommand::NextPage { count } => {
                let current = self.reading_page();
                self.goto_page(current.saturating_add(count).min(last_page));
            }
            ReaderCommand::PrevPage { count } => {
                let current = self.reading_page();
                self.goto_page(current.saturating_sub(count));
            }
            ReaderCommand::GotoPage { page } => self.goto_page(page.min(last_page)),
        }
    }

    /// Moves to the top of `index`. Until every page up to it has a size its
    /// offset is provisional, so the jump is kept and re-applied as geometry
    /// settles.
    fn goto_page(&mut self, index: usize) {
        self.move_to(self.page_offset(index));
        let sized = self.pages.iter().take(index + 1).all(|p| p.status.is_settled());
        self.pending_target = (!sized).then_some(index);
    }

    fn reading_page(&self) -> usize {
        self.pending_target
            .or_else(|| self.current_page())
            .unwrap_or(0)
    }

    fn page_offset(&self, index: usize) -> f64 {
        self.layout.offset_of(index).unwrap_or(0.0)
    }

    pub fn current_page(&self) -> Option<usize> {
        self.layout
            .page_at_offset(self.window.scroll().current_offset)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            current_page: self.current_page(),
            page_count: self.pages.len(),
            settled: self.pages.iter().filter(|p| p.status.is_settled()).count(),
            failed: self
                .pages
                .iter()
                .filter(|p| p.status == PageStatus::Failed)
                .count(),
        }
    }

    fn publish(&self, change: WindowChange) {
        if change.is_empty() {
            return;
        }
        self.events.lock().push(ReaderEvent::WindowChanged {
            session: self.token,
            change,
        });
    }

    fn redraw(&self) {
        self.events
            .lock()
            .push(ReaderEvent::RedrawNeeded(self.token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::dimensions::{DimensionResolver, SizeProbe};
    use crate::error::ReaderError;
    use anyhow::{anyhow, Result};
    use tokio::sync::mpsc;

    struct FixedManifest(Option<ChapterManifest>);

    #[async_trait::async_trait]
    impl ManifestSource for FixedManifest {
        async fn fetch_manifest(&self, _chapter: ChapterId) -> Result<ChapterManifest> {
            self.0.clone().ok_or_else(|| anyhow!("503 from at-home server"))
        }
    }

    struct TableProbe(HashMap<String, (u32, u32)>);

    #[async_trait::async_trait]
    impl SizeProbe for TableProbe {
        async fn probe_size(&self, url: &str) -> Result<(u32, u32)> {
            let file = url.rsplit('/').next().unwrap_or_default();
            self.0
                .get(file)
                .copied()
                .ok_or_else(|| anyhow!("cannot decode {file}"))
        }
    }

    fn abc_manifest() -> ChapterManifest {
        ChapterManifest {
            base_url: "https://node.example.org".into(),
            hash: "h".into(),
            page_files: vec!["a.png".into(), "b.png".into(), "c.png".into()],
        }
    }

    fn abc_probe() -> TableProbe {
        TableProbe(HashMap::from([
            ("a.png".to_owned(), (800, 1200)),
            ("c.png".to_owned(), (1000, 1000)),
        ]))
    }

    async fn open_abc(viewport: Viewport) -> ChapterSession {
        let resolver = ManifestResolver::new(FixedManifest(Some(abc_manifest())));
        ChapterSession::open(
            &resolver,
            Uuid::new_v4(),
            viewport,
            WindowConfig::default(),
            40.0,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_three_pages() {
        let viewport = Viewport::new(400.0, 800.0);
        let mut session = open_abc(viewport).await;
        assert_eq!(session.layout().total_height(), 0.0);
        assert_eq!(
            session.handle_gesture(GestureEvent::Move { x: 390.0, y: 400.0 }),
            None
        );
        session.handle_gesture(GestureEvent::Release);

        let resolver = DimensionResolver::new(abc_probe(), 2, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = resolver
            .stream(session.token(), session.pending_requests(), tx)
            .await;
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.failed, 1);
        while let Some(batch) = rx.recv().await {
            session.apply_dimensions(&batch);
        }

        let heights: Vec<_> = session
            .layout()
            .entries()
            .iter()
            .map(|e| e.rendered_height)
            .collect();
        assert_eq!(heights, [600.0, 400.0, 400.0]);
        assert_eq!(session.layout().total_height(), 1400.0);

        let command = session
            .handle_gesture(GestureEvent::Move { x: 390.0, y: 400.0 })
            .unwrap();
        assert_eq!(command.offset, 700.0);
        assert_eq!(session.scroll().current_offset, 700.0);
        assert_eq!(session.current_page(), Some(1));
        assert_eq!(session.scrub_state(), ScrubState::Dragging);

        let status = session.status();
        assert_eq!(status.settled, 3);
        assert_eq!(status.failed, 1);
    }

    fn pending_session(pages: usize) -> ChapterSession {
        let manifest = ChapterManifest {
            base_url: "https://node.example.org".into(),
            hash: "h".into(),
            page_files: (0..pages).map(|i| format!("{i}.png")).collect(),
        };
        let resolved = ResolvedChapter {
            chapter: Uuid::new_v4(),
            pages: manifest.seed_pages(),
            manifest,
        };
        ChapterSession::new(
            resolved,
            Viewport::new(400.0, 800.0),
            WindowConfig::default(),
            40.0,
        )
    }

    fn square(session: &ChapterSession, pages: std::ops::Range<usize>) -> Vec<DimensionUpdate> {
        pages
            .map(|index| DimensionUpdate {
                session: session.token(),
                index,
                status: PageStatus::Resolved {
                    width: 400,
                    height: 400,
                },
            })
            .collect()
    }

    #[test]
    fn unsized_chapter_opens_at_the_top() {
        let session = pending_session(50);
        let mounted: Vec<_> = session.mounted_pages().iter().map(|p| p.index).collect();
        assert_eq!(mounted, [0, 1, 2, 3, 4]);
        assert_eq!(session.current_page(), Some(0));
        assert_eq!(session.status().current_page, Some(0));
    }

    #[test]
    fn page_jump_waits_for_sizes() {
        let mut session = pending_session(10);
        session.apply(ReaderCommand::GotoPage { page: 6 });
        assert_eq!(session.scroll().current_offset, 0.0);

        let first = square(&session, 0..3);
        session.apply_dimensions(&first);
        assert_eq!(session.scroll().current_offset, 1200.0);

        let rest = square(&session, 3..10);
        session.apply_dimensions(&rest);
        assert_eq!(session.scroll().current_offset, 2400.0);
        assert_eq!(session.current_page(), Some(6));

        // Settled: later geometry no longer drags the view.
        session.apply(ReaderCommand::ScrollBy { pixels: -100.0 });
        assert_eq!(session.scroll().current_offset, 2300.0);
    }

    #[test]
    fn relative_jumps_stack_while_unsized() {
        let mut session = pending_session(10);
        session.apply(ReaderCommand::NextPage { count: 2 });
        session.apply(ReaderCommand::NextPage { count: 3 });
        let all = square(&session, 0..10);
        session.apply_dimensions(&all);
        assert_eq!(session.current_page(), Some(5));
    }

    #[test]
    fn manual_scroll_cancels_waiting_jump() {
        let mut session = pending_session(10);
        session.apply(ReaderCommand::GotoPage { page: 6 });
        session.apply(ReaderCommand::ScrollBy { pixels: 10.0 });
        let all = square(&session, 0..10);
        session.apply_dimensions(&all);
        assert_eq!(session.scroll().current_offset, 0.0);
        assert_eq!(session.current_page(), Some(0));
    }

    #[tokio::test]
    async fn manifest_failure_opens_nothing() {
        let resolver = ManifestResolver::new(FixedManifest(None));
        let result = ChapterSession::open(
            &resolver,
            Uuid::new_v4(),
            Viewport::new(400.0, 800.0),
            WindowConfig::default(),
            40.0,
        )
        .await;
        assert!(matches!(
            result,
            Err(ReaderError::ManifestUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn updates_for_another_session_are_discarded() {
        let mut closed = open_abc(Viewport::new(400.0, 800.0)).await;
        let mut current = open_abc(Viewport::new(400.0, 800.0)).await;
        let stale = DimensionUpdate {
            session: closed.token(),
            index: 0,
            status: PageStatus::Resolved {
                width: 10,
                height: 10,
            },
        };

        assert_eq!(current.apply_dimensions(&[stale]), 0);
        assert_eq!(current.pages()[0].status, PageStatus::Pending);
        assert_eq!(closed.apply_dimensions(&[stale]), 1);
    }

    #[tokio::test]
    async fn settled_pages_never_revert_and_out_of_range_is_ignored() {
        let mut session = open_abc(Viewport::new(400.0, 800.0)).await;
        let token = session.token();
        let update = |index, status| DimensionUpdate {
            session: token,
            index,
            status,
        };
        session.apply_dimensions(&[update(1, PageStatus::Failed)]);
        let applied = session.apply_dimensions(&[
            update(
                1,
                PageStatus::Resolved {
                    width: 1,
                    height: 2,
                },
            ),
            update(9, PageStatus::Failed),
        ]);
        assert_eq!(applied, 0);
        assert_eq!(session.pages()[1].status, PageStatus::Failed);
        assert_eq!(session.layout().entries()[1].rendered_height, 400.0);
    }

    #[tokio::test]
    async fn viewport_change_keeps_reading_position() {
        let mut session = open_abc(Viewport::new(400.0, 800.0)).await;
        let token = session.token();
        session.apply_dimensions(&[
            DimensionUpdate {
                session: token,
                index: 0,
                status: PageStatus::Resolved {
                    width: 800,
                    height: 1200,
                },
            },
            DimensionUpdate {
                session: token,
                index: 1,
                status: PageStatus::Failed,
            },
            DimensionUpdate {
                session: token,
                index: 2,
                status: PageStatus::Failed,
            },
        ]);
        session.scroll_to(800.0);
        assert_eq!(session.current_page(), Some(1));

        session.set_viewport(Viewport::new(800.0, 600.0));
        assert_eq!(session.layout().total_height(), 2800.0);
        assert_eq!(session.scroll().current_offset, 1600.0);
        assert_eq!(session.current_page(), Some(1));
    }

    #[tokio::test]
    async fn keyboard_commands_move_by_pages() {
        let mut session = open_abc(Viewport::new(400.0, 800.0)).await;
        let token = session.token();
        let updates: Vec<_> = (0..3)
            .map(|index| DimensionUpdate {
                session: token,
                index,
                status: PageStatus::Failed,
            })
            .collect();
        session.apply_dimensions(&updates);

        session.apply(ReaderCommand::NextPage { count: 1 });
        assert_eq!(session.scroll().current_offset, 400.0);
        session.apply(ReaderCommand::NextPage { count: 10 });
        assert_eq!(session.current_page(), Some(2));
        session.apply(ReaderCommand::PrevPage { count: 2 });
        assert_eq!(session.scroll().current_offset, 0.0);
        session.apply(ReaderCommand::ScrollScreens { screens: 0.5 });
        assert_eq!(session.scroll().current_offset, 400.0);
        session.apply(ReaderCommand::GotoPage { page: usize::MAX });
        assert_eq!(session.current_page(), Some(2));

        let events = session.events();
        let log = events.lock();
        assert!(log
            .iter()
            .any(|event| matches!(event, ReaderEvent::RedrawNeeded(t) if *t == token)));
        assert_eq!(
            log.iter()
                .filter(|event| matches!(event, ReaderEvent::PageSettled { .. }))
                .count(),
            3
        );
    }
}
