use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::data::{CommentService, FeedFilters, FeedService, InteractionService};
use crate::dispatch::Spawn;
use crate::engagement::{
    EngagementStore, EngagementView, MutationRequest, MutationTicket, Resolution, Settlement,
};
use crate::error::{FetchError, MutationError, PlaybackError};
use crate::model::{CommentNode, Engageable, MediaAttachment, Post, Row, Vote};
use crate::pagination::{FetchTicket, Page, PaginationController};
use crate::playback::{
    ElementSample, HeadlessElement, MediaElement, MediaPlaybackController, PlaybackConfig,
    PlaybackStatus,
};
use crate::size_cache::Estimator;
use crate::threads::ThreadExpander;
use crate::virtualizer::{Align, VirtualWindow, VisibleRange, WindowVirtualizer};

/// Backend collaborators plus the place their calls run.
#[derive(Clone)]
pub struct Services {
    pub feed: Arc<dyn FeedService>,
    pub comments: Arc<dyn CommentService>,
    pub interactions: Arc<dyn InteractionService>,
    pub spawner: Arc<dyn Spawn>,
}

impl Services {
    pub fn from_backend<B>(backend: Arc<B>, spawner: Arc<dyn Spawn>) -> Self
    where
        B: FeedService + CommentService + InteractionService + 'static,
    {
        Self {
            feed: backend.clone(),
            comments: backend.clone(),
            interactions: backend,
            spawner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewOptions {
    pub page_size: usize,
    pub fetch_threshold: usize,
    pub overscan: usize,
    pub estimator: Estimator,
    pub playback: PlaybackConfig,
    /// Starting one media item pauses the one that was playing.
    pub exclusive_playback: bool,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            page_size: 10,
            fetch_threshold: 3,
            overscan: 2,
            estimator: Estimator::default(),
            playback: PlaybackConfig::default(),
            exclusive_playback: false,
        }
    }
}

/// Builds the player surface for a media item when its row comes into view.
pub trait MediaElementFactory {
    fn create(&self, media: &MediaAttachment) -> Box<dyn MediaElement>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessFactory;

impl MediaElementFactory for HeadlessFactory {
    fn create(&self, _media: &MediaAttachment) -> Box<dyn MediaElement> {
        Box::new(HeadlessElement::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    FetchFailed,
    MutationFailed,
    CommentFailed,
    PlaybackFailed,
}

/// A one-shot message for the host, e.g. a toast after a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Scroll state over a virtualizer, with anchoring for rows above the viewport.
#[derive(Debug)]
struct Viewport {
    rows: WindowVirtualizer,
    scroll_offset: f64,
    height: f64,
    overscan: usize,
}

impl Viewport {
    fn new(estimator: Estimator, overscan: usize) -> Self {
        Self {
            rows: WindowVirtualizer::new(estimator),
            scroll_offset: 0.0,
            height: 0.0,
            overscan,
        }
    }

    fn scroll_to(&mut self, offset: f64) {
        self.scroll_offset = self.rows.clamp_scroll(offset, self.height);
    }

    fn set_height(&mut self, height: f64) {
        self.height = if height.is_finite() {
            height.max(0.0)
        } else {
            0.0
        };
        self.scroll_to(self.scroll_offset);
    }

    fn range(&self) -> VisibleRange {
        self.rows
            .visible_range(self.scroll_offset, self.height, self.overscan)
    }

    fn window(&self) -> VirtualWindow {
        self.rows.window(self.scroll_offset, self.height, self.overscan)
    }

    /// Keeps the content under the viewport still when a row starting above it changes.
    fn anchor(&mut self, row_start: f64, delta: f64) {
        if delta != 0.0 && row_start < self.scroll_offset {
            self.scroll_offset += delta;
        }
        self.scroll_to(self.scroll_offset);
    }

    fn apply_measurements(&mut self, measured: Vec<(String, f64)>) -> bool {
        let mut changed = false;
        for (key, height) in measured {
            let Some(index) = self.rows.index_of(&key) else {
                continue;
            };
            let start = self.rows.start_of(index);
            match self.rows.measure(&key, height) {
                Ok(delta) if delta != 0.0 => {
                    self.anchor(start, delta);
                    changed = true;
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "measurement ignored"),
            }
        }
        changed
    }
}

fn submit_mutation<M>(
    services: &Services,
    alive: &Arc<AtomicBool>,
    tx: &Sender<M>,
    ticket: MutationTicket,
    wrap: fn(MutationTicket, Result<(), MutationError>) -> M,
) where
    M: Send + 'static,
{
    let interactions = Arc::clone(&services.interactions);
    let alive = Arc::clone(alive);
    let tx = tx.clone();
    services.spawner.spawn(Box::new(move || {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let result = match ticket.request {
            MutationRequest::SetVote(vote) => interactions.submit_vote(&ticket.item_id, vote),
            MutationRequest::ToggleBookmark => {
                interactions.submit_bookmark_toggle(&ticket.item_id)
            }
        };
        let _ = tx.send(wrap(ticket, result));
    }));
}

fn apply_settlement(item: &mut dyn Engageable, settlement: Settlement) {
    match settlement {
        Settlement::Vote(tally) => item.set_tally(tally),
        Settlement::Bookmark(bookmarked) => item.set_bookmarked(bookmarked),
    }
}

/// Writes a resolved mutation into the item list. Failures become notices; a held
/// intent comes back as the ticket to submit next.
fn settle<F>(
    resolution: Resolution,
    item: Option<&mut dyn Engageable>,
    describe: F,
    notices: &mut Vec<Notice>,
) -> Option<MutationTicket>
where
    F: FnOnce(&Settlement) -> &'static str,
{
    match resolution {
        Resolution::Settled(settlement) => {
            if let Some(item) = item {
                apply_settlement(item, settlement);
            }
            None
        }
        Resolution::RolledBack(settlement, err) => {
            let what = describe(&settlement);
            if let Some(item) = item {
                apply_settlement(item, settlement);
            }
            notices.push(Notice::new(
                NoticeKind::MutationFailed,
                format!("Could not save {what}: {err}"),
            ));
            None
        }
        Resolution::Continued { confirmed, next } => {
            if let (Some(item), Some(settlement)) = (item, confirmed) {
                apply_settlement(item, settlement);
            }
            Some(next)
        }
        Resolution::Stale => None,
    }
}

fn settlement_label(settlement: &Settlement) -> &'static str {
    match settlement {
        Settlement::Vote(_) => "vote",
        Settlement::Bookmark(_) => "bookmark",
    }
}

enum FeedResponse {
    Page {
        ticket: FetchTicket,
        result: Result<Page<Post>, FetchError>,
    },
    Mutation {
        ticket: MutationTicket,
        result: Result<(), MutationError>,
    },
    Sample {
        media_id: String,
        sample: ElementSample,
    },
}

/// What the host renders for one visible post.
pub struct PostSlot<'a> {
    pub index: usize,
    pub start: f64,
    pub size: f64,
    pub post: &'a Post,
    pub engagement: EngagementView,
    players: &'a HashMap<String, MediaPlaybackController>,
}

impl<'a> PostSlot<'a> {
    pub fn player(&self, media_id: &str) -> Option<&'a MediaPlaybackController> {
        self.players.get(media_id)
    }
}

/// The paginated post list: virtualization, optimistic engagement and mounted players.
pub struct FeedView {
    services: Services,
    options: ViewOptions,
    filters: FeedFilters,
    pagination: PaginationController<Post>,
    viewport: Viewport,
    engagement: EngagementStore,
    players: HashMap<String, MediaPlaybackController>,
    elements: Box<dyn MediaElementFactory>,
    active_media: Option<String>,
    notices: Vec<Notice>,
    response_tx: Sender<FeedResponse>,
    response_rx: Receiver<FeedResponse>,
    alive: Arc<AtomicBool>,
}

impl FeedView {
    pub fn new(
        services: Services,
        options: ViewOptions,
        elements: Box<dyn MediaElementFactory>,
    ) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            services,
            options,
            filters: FeedFilters::default(),
            pagination: PaginationController::new(options.page_size),
            viewport: Viewport::new(options.estimator, options.overscan),
            engagement: EngagementStore::new(),
            players: HashMap::new(),
            elements,
            active_media: None,
            notices: Vec::new(),
            response_tx,
            response_rx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_filters(mut self, filters: FeedFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> &[Post] {
        self.pagination.items()
    }

    pub fn post(&self, id: &str) -> Option<&Post> {
        self.pagination.get(id)
    }

    pub fn filters(&self) -> &FeedFilters {
        &self.filters
    }

    pub fn has_more(&self) -> bool {
        self.pagination.has_more()
    }

    pub fn is_fetching(&self) -> bool {
        self.pagination.is_fetching()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.pagination.last_error()
    }

    pub fn engagement(&self, post_id: &str) -> Option<EngagementView> {
        self.pagination
            .get(post_id)
            .map(|post| self.engagement.view(post))
    }

    pub fn virtualizer(&self) -> &WindowVirtualizer {
        &self.viewport.rows
    }

    pub fn scroll_offset(&self) -> f64 {
        self.viewport.scroll_offset
    }

    pub fn total_size(&self) -> f64 {
        self.viewport.rows.total_size()
    }

    pub fn window(&self) -> VirtualWindow {
        self.viewport.window()
    }

    pub fn player(&self, media_id: &str) -> Option<&MediaPlaybackController> {
        self.players.get(media_id)
    }

    pub fn active_player_mut(&mut self) -> Option<&mut MediaPlaybackController> {
        let id = self.active_media.as_deref()?;
        self.players.get_mut(id)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        mem::take(&mut self.notices)
    }

    pub fn on_scroll(&mut self, offset: f64) {
        if !self.is_alive() {
            return;
        }
        self.viewport.scroll_to(offset);
        self.sync_media();
        self.maybe_fetch();
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        if !self.is_alive() {
            return;
        }
        self.viewport.set_height(height);
        self.sync_media();
        self.maybe_fetch();
    }

    /// Scrolls so the post is visible with the given alignment.
    pub fn scroll_to_post(&mut self, post_id: &str, align: Align) -> bool {
        let Some(index) = self.viewport.rows.index_of(post_id) else {
            return false;
        };
        let offset = self
            .viewport
            .rows
            .scroll_offset_for(index, align, self.viewport.height);
        self.on_scroll(offset);
        true
    }

    /// Hands every visible post to `render`; a returned height is recorded as the row's
    /// measured size. Returns the window after measurements were applied.
    pub fn render_visible<F>(&mut self, mut render: F) -> VirtualWindow
    where
        F: FnMut(PostSlot<'_>) -> Option<f64>,
    {
        if !self.is_alive() {
            return self.viewport.window();
        }
        let window = self.viewport.window();
        let mut measured = Vec::new();
        for item in &window.items {
            let Some(post) = self.pagination.items().get(item.index) else {
                continue;
            };
            let slot = PostSlot {
                index: item.index,
                start: item.start,
                size: item.size,
                post,
                engagement: self.engagement.view(post),
                players: &self.players,
            };
            if let Some(height) = render(slot) {
                measured.push((item.key.clone(), height));
            }
        }
        if self.viewport.apply_measurements(measured) {
            self.sync_media();
        }
        self.maybe_fetch();
        self.viewport.window()
    }

    fn maybe_fetch(&mut self) {
        if self.pagination.last_error().is_some() {
            return;
        }
        let range = self.viewport.range();
        let last_rendered = if range.empty { 0 } else { range.end };
        if self.pagination.should_fetch_next(
            last_rendered,
            self.pagination.len(),
            self.options.fetch_threshold,
        ) {
            self.load_more();
        }
    }

    /// Requests the next page. A no-op while a fetch is in flight or the feed is exhausted.
    pub fn load_more(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(ticket) = self.pagination.begin_fetch() else {
            return false;
        };
        debug!(page = ticket.request.page, "fetching posts");
        let feed = Arc::clone(&self.services.feed);
        let filters = self.filters.clone();
        let alive = Arc::clone(&self.alive);
        let tx = self.response_tx.clone();
        self.services.spawner.spawn(Box::new(move || {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let result = feed.fetch_page(&ticket.request, &filters);
            let _ = tx.send(FeedResponse::Page { ticket, result });
        }));
        true
    }

    pub fn retry(&mut self) -> bool {
        if self.pagination.last_error().is_none() && !self.pagination.is_empty() {
            return false;
        }
        self.load_more()
    }

    /// Starts over with new filters. In-flight pages for the old filters are discarded.
    pub fn set_filters(&mut self, filters: FeedFilters) {
        if !self.is_alive() || filters == self.filters {
            return;
        }
        info!(space = ?filters.space, sort = filters.sort.label(), "feed filters changed");
        self.filters = filters;
        self.pagination.reset();
        self.viewport.rows.set_rows(Vec::new());
        self.viewport.scroll_to(0.0);
        self.players.clear();
        self.active_media = None;
        self.load_more();
    }

    /// Applies the vote optimistically. Returns the request sent to the backend; `None`
    /// also covers a toggle held behind a request that is still in flight.
    pub fn toggle_vote(&mut self, post_id: &str, direction: Vote) -> Option<MutationTicket> {
        if !self.is_alive() {
            return None;
        }
        let post = self.pagination.get(post_id)?;
        let ticket = self.engagement.toggle_vote(post, direction)?;
        submit_mutation(
            &self.services,
            &self.alive,
            &self.response_tx,
            ticket.clone(),
            |ticket, result| FeedResponse::Mutation { ticket, result },
        );
        Some(ticket)
    }

    pub fn toggle_bookmark(&mut self, post_id: &str) -> Option<MutationTicket> {
        if !self.is_alive() {
            return None;
        }
        let post = self.pagination.get(post_id)?;
        let ticket = self.engagement.toggle_bookmark(post)?;
        submit_mutation(
            &self.services,
            &self.alive,
            &self.response_tx,
            ticket.clone(),
            |ticket, result| FeedResponse::Mutation { ticket, result },
        );
        Some(ticket)
    }

    /// Starts playback of one media item. Other players keep their state unless
    /// `exclusive_playback` is set, in which case a playing one is paused.
    pub fn play_media(&mut self, media_id: &str, now: Instant) -> Result<(), PlaybackError> {
        if !self.is_alive() {
            return Ok(());
        }
        let media = self
            .pagination
            .items()
            .iter()
            .find_map(|post| post.find_media(media_id))
            .cloned()
            .ok_or_else(|| PlaybackError::MissingSource(media_id.to_string()))?;
        if let Some(previous) = self.active_media.take() {
            if self.options.exclusive_playback && previous != media_id {
                if let Some(player) = self.players.get_mut(&previous) {
                    if player.status() == PlaybackStatus::Playing {
                        let _ = player.tap(now);
                    }
                }
            }
        }
        let elements = &self.elements;
        let playback = self.options.playback;
        let player = self
            .players
            .entry(media.id.clone())
            .or_insert_with(|| MediaPlaybackController::new(&media, elements.create(&media), playback));
        match player.tap_play(now) {
            Ok(()) => {
                self.active_media = Some(media.id);
                Ok(())
            }
            Err(err) => {
                self.notices.push(Notice::new(
                    NoticeKind::PlaybackFailed,
                    format!("Could not play {}: {err}", media.label()),
                ));
                Err(err)
            }
        }
    }

    /// Fires due auto-hide tasks and starts a progress query for the active element.
    /// The query runs on the spawner; its result lands in [`FeedView::poll_async`].
    /// Returns whether anything visible changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut changed = false;
        for player in self.players.values_mut() {
            changed |= player.tick(now);
        }
        let sampler = match self.active_media.as_deref() {
            Some(id) => self
                .players
                .get_mut(id)
                .and_then(MediaPlaybackController::begin_sample)
                .map(|sampler| (id.to_string(), sampler)),
            None => None,
        };
        if let Some((media_id, sampler)) = sampler {
            let alive = Arc::clone(&self.alive);
            let tx = self.response_tx.clone();
            self.services.spawner.spawn(Box::new(move || {
                if !alive.load(Ordering::SeqCst) {
                    return;
                }
                let sample = sampler();
                let _ = tx.send(FeedResponse::Sample { media_id, sample });
            }));
        }
        changed
    }

    /// Drains finished background calls. Nothing is applied after [`FeedView::unmount`].
    pub fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            if !self.is_alive() {
                continue;
            }
            self.handle_response(message);
            changed = true;
        }
        changed
    }

    fn handle_response(&mut self, message: FeedResponse) {
        match message {
            FeedResponse::Page { ticket, result } => match result {
                Ok(page) => {
                    let engagement = &self.engagement;
                    let applied = self.pagination.complete_fetch(
                        ticket,
                        page.items,
                        page.has_more,
                        |id| engagement.is_pending(id),
                    );
                    if applied.is_ok() {
                        self.sync_rows();
                    }
                }
                Err(err) => {
                    let message = format!("Could not load posts: {err}");
                    if self.pagination.fail_fetch(ticket, err).is_ok() {
                        warn!("{message}");
                        self.notices
                            .push(Notice::new(NoticeKind::FetchFailed, message));
                    }
                }
            },
            FeedResponse::Mutation { ticket, result } => {
                let resolution = self.engagement.resolve(&ticket, result);
                let item = self
                    .pagination
                    .get_mut(&ticket.item_id)
                    .map(|post| post as &mut dyn Engageable);
                if let Some(next) = settle(resolution, item, settlement_label, &mut self.notices) {
                    submit_mutation(
                        &self.services,
                        &self.alive,
                        &self.response_tx,
                        next,
                        |ticket, result| FeedResponse::Mutation { ticket, result },
                    );
                }
            }
            FeedResponse::Sample { media_id, sample } => {
                if let Some(player) = self.players.get_mut(&media_id) {
                    player.apply_sample(sample, Instant::now());
                }
            }
        }
    }

    fn sync_rows(&mut self) {
        let rows: Vec<_> = self
            .pagination
            .items()
            .iter()
            .map(|post| (post.id.clone(), post.shape(false)))
            .collect();
        self.viewport.rows.set_rows(rows);
        self.viewport.scroll_to(self.viewport.scroll_offset);
        self.sync_media();
    }

    /// Mounts controllers for playable media in the window and drops the rest.
    fn sync_media(&mut self) {
        let range = self.viewport.range();
        let visible: Vec<&MediaAttachment> = range
            .indices()
            .filter_map(|index| self.pagination.items().get(index))
            .flat_map(|post| post.playable_media())
            .collect();
        let keep: HashSet<&str> = visible.iter().map(|media| media.id.as_str()).collect();
        self.players.retain(|id, _| keep.contains(id.as_str()));
        for media in visible {
            if !self.players.contains_key(&media.id) {
                let element = self.elements.create(media);
                self.players.insert(
                    media.id.clone(),
                    MediaPlaybackController::new(media, element, self.options.playback),
                );
            }
        }
        if let Some(active) = &self.active_media {
            if !self.players.contains_key(active) {
                self.active_media = None;
            }
        }
    }

    /// A thread view over one post, sharing this feed's collaborators.
    pub fn open_thread(&self, post_id: &str) -> ThreadView {
        ThreadView::new(post_id, self.services.clone(), self.options)
    }

    /// Stops applying results and releases every media element.
    pub fn unmount(&mut self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        for (_, mut player) in self.players.drain() {
            player.unmount();
        }
        self.active_media = None;
        debug!("feed view unmounted");
    }
}

impl Drop for FeedView {
    fn drop(&mut self) {
        self.unmount();
    }
}

enum ThreadResponse {
    Page {
        ticket: FetchTicket,
        result: Result<Page<CommentNode>, FetchError>,
    },
    Replies {
        comment_id: String,
        result: Result<Vec<CommentNode>, FetchError>,
    },
    Mutation {
        ticket: MutationTicket,
        result: Result<(), MutationError>,
    },
    Comment {
        result: Result<CommentNode, MutationError>,
    },
}

/// What the host renders for one visible top-level comment.
pub struct CommentSlot<'a> {
    pub index: usize,
    pub start: f64,
    pub size: f64,
    pub comment: &'a CommentNode,
    pub engagement: EngagementView,
    pub expanded: bool,
    pub loading_replies: bool,
    store: &'a EngagementStore,
}

impl CommentSlot<'_> {
    /// Optimistic view of a reply shown under this comment.
    pub fn reply_engagement(&self, reply: &CommentNode) -> EngagementView {
        self.store.view(reply)
    }
}

fn find_comment<'a>(
    comments: &'a PaginationController<CommentNode>,
    id: &str,
) -> Option<&'a CommentNode> {
    comments.get(id).or_else(|| {
        comments
            .items()
            .iter()
            .flat_map(|node| node.replies.iter())
            .find(|reply| reply.id == id)
    })
}

fn find_comment_mut<'a>(
    comments: &'a mut PaginationController<CommentNode>,
    id: &str,
) -> Option<&'a mut CommentNode> {
    let owner = top_level_owner(comments, id)?;
    let node = comments.get_mut(&owner)?;
    if node.id == id {
        return Some(node);
    }
    node.replies.iter_mut().find(|reply| reply.id == id)
}

/// Id of the top-level comment that is or contains `id`.
fn top_level_owner(comments: &PaginationController<CommentNode>, id: &str) -> Option<String> {
    if comments.get(id).is_some() {
        return Some(id.to_string());
    }
    comments
        .items()
        .iter()
        .find(|node| node.replies.iter().any(|reply| reply.id == id))
        .map(|node| node.id.clone())
}

/// Comments of one post with one level of expandable replies.
pub struct ThreadView {
    post_id: String,
    services: Services,
    options: ViewOptions,
    pagination: PaginationController<CommentNode>,
    viewport: Viewport,
    engagement: EngagementStore,
    expander: ThreadExpander,
    loading_replies: HashSet<String>,
    notices: Vec<Notice>,
    response_tx: Sender<ThreadResponse>,
    response_rx: Receiver<ThreadResponse>,
    alive: Arc<AtomicBool>,
}

impl ThreadView {
    pub fn new(post_id: &str, services: Services, options: ViewOptions) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            post_id: post_id.to_string(),
            services,
            options,
            pagination: PaginationController::new(options.page_size),
            viewport: Viewport::new(options.estimator, options.overscan),
            engagement: EngagementStore::new(),
            expander: ThreadExpander::new(),
            loading_replies: HashSet::new(),
            notices: Vec::new(),
            response_tx,
            response_rx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn comments(&self) -> &[CommentNode] {
        self.pagination.items()
    }

    pub fn comment(&self, id: &str) -> Option<&CommentNode> {
        find_comment(&self.pagination, id)
    }

    pub fn engagement(&self, comment_id: &str) -> Option<EngagementView> {
        self.comment(comment_id)
            .map(|node| self.engagement.view(node))
    }

    pub fn is_expanded(&self, comment_id: &str) -> bool {
        self.expander.is_expanded(comment_id)
    }

    pub fn is_loading_replies(&self, comment_id: &str) -> bool {
        self.loading_replies.contains(comment_id)
    }

    pub fn has_more(&self) -> bool {
        self.pagination.has_more()
    }

    pub fn is_fetching(&self) -> bool {
        self.pagination.is_fetching()
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.pagination.last_error()
    }

    pub fn virtualizer(&self) -> &WindowVirtualizer {
        &self.viewport.rows
    }

    pub fn scroll_offset(&self) -> f64 {
        self.viewport.scroll_offset
    }

    pub fn total_size(&self) -> f64 {
        self.viewport.rows.total_size()
    }

    pub fn window(&self) -> VirtualWindow {
        self.viewport.window()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        mem::take(&mut self.notices)
    }

    pub fn on_scroll(&mut self, offset: f64) {
        if !self.is_alive() {
            return;
        }
        self.viewport.scroll_to(offset);
        self.maybe_fetch();
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        if !self.is_alive() {
            return;
        }
        self.viewport.set_height(height);
        self.maybe_fetch();
    }

    pub fn scroll_to_comment(&mut self, comment_id: &str, align: Align) -> bool {
        let Some(owner) = top_level_owner(&self.pagination, comment_id) else {
            return false;
        };
        let Some(index) = self.viewport.rows.index_of(&owner) else {
            return false;
        };
        let offset = self
            .viewport
            .rows
            .scroll_offset_for(index, align, self.viewport.height);
        self.on_scroll(offset);
        true
    }

    pub fn render_visible<F>(&mut self, mut render: F) -> VirtualWindow
    where
        F: FnMut(CommentSlot<'_>) -> Option<f64>,
    {
        if !self.is_alive() {
            return self.viewport.window();
        }
        let window = self.viewport.window();
        let mut measured = Vec::new();
        for item in &window.items {
            let Some(comment) = self.pagination.items().get(item.index) else {
                continue;
            };
            let slot = CommentSlot {
                index: item.index,
                start: item.start,
                size: item.size,
                comment,
                engagement: self.engagement.view(comment),
                expanded: self.expander.is_expanded(&comment.id),
                loading_replies: self.loading_replies.contains(&comment.id),
                store: &self.engagement,
            };
            if let Some(height) = render(slot) {
                measured.push((item.key.clone(), height));
            }
        }
        self.viewport.apply_measurements(measured);
        self.maybe_fetch();
        self.viewport.window()
    }

    fn maybe_fetch(&mut self) {
        if self.pagination.last_error().is_some() {
            return;
        }
        let range = self.viewport.range();
        let last_rendered = if range.empty { 0 } else { range.end };
        if self.pagination.should_fetch_next(
            last_rendered,
            self.pagination.len(),
            self.options.fetch_threshold,
        ) {
            self.load_more();
        }
    }

    pub fn load_more(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(ticket) = self.pagination.begin_fetch() else {
            return false;
        };
        let comments = Arc::clone(&self.services.comments);
        let post_id = self.post_id.clone();
        let alive = Arc::clone(&self.alive);
        let tx = self.response_tx.clone();
        self.services.spawner.spawn(Box::new(move || {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let result = comments.fetch_comments(&post_id, &ticket.request);
            let _ = tx.send(ThreadResponse::Page { ticket, result });
        }));
        true
    }

    pub fn retry(&mut self) -> bool {
        if self.pagination.last_error().is_none() && !self.pagination.is_empty() {
            return false;
        }
        self.load_more()
    }

    /// Expands or collapses a comment's replies, fetching them the first time they are
    /// needed. Returns the new expansion state, or `None` for unknown comments.
    pub fn toggle_replies(&mut self, comment_id: &str) -> Option<bool> {
        if !self.is_alive() {
            return None;
        }
        let node = self.pagination.get(comment_id)?;
        if node.reply_count == 0 {
            return Some(false);
        }
        let reply_count = node.reply_count;
        let needs_fetch = !node.replies_loaded();
        let expanded = self.toggle_row(comment_id, reply_count);
        if expanded && needs_fetch && self.loading_replies.insert(comment_id.to_string()) {
            let comments = Arc::clone(&self.services.comments);
            let comment_id = comment_id.to_string();
            let alive = Arc::clone(&self.alive);
            let tx = self.response_tx.clone();
            self.services.spawner.spawn(Box::new(move || {
                if !alive.load(Ordering::SeqCst) {
                    return;
                }
                let result = comments.fetch_replies(&comment_id);
                let _ = tx.send(ThreadResponse::Replies { comment_id, result });
            }));
        }
        Some(expanded)
    }

    /// Expands every loaded comment that has replies. Returns how many changed.
    pub fn expand_all_replies(&mut self) -> usize {
        let expander = &self.expander;
        let targets: Vec<String> = self
            .pagination
            .items()
            .iter()
            .filter(|node| node.reply_count > 0 && !expander.is_expanded(&node.id))
            .map(|node| node.id.clone())
            .collect();
        self.toggle_each(&targets)
    }

    pub fn collapse_all_replies(&mut self) -> usize {
        let expander = &self.expander;
        let targets: Vec<String> = self
            .pagination
            .items()
            .iter()
            .filter(|node| expander.is_expanded(&node.id))
            .map(|node| node.id.clone())
            .collect();
        self.toggle_each(&targets)
    }

    fn toggle_each(&mut self, ids: &[String]) -> usize {
        ids.iter()
            .filter(|id| self.toggle_replies(id).is_some())
            .count()
    }

    fn toggle_row(&mut self, comment_id: &str, reply_count: usize) -> bool {
        let start = self
            .viewport
            .rows
            .index_of(comment_id)
            .map(|index| self.viewport.rows.start_of(index))
            .unwrap_or(f64::INFINITY);
        let before = self.viewport.rows.total_size();
        let expanded = self
            .expander
            .toggle(comment_id, reply_count, &mut self.viewport.rows);
        let delta = self.viewport.rows.total_size() - before;
        self.viewport.anchor(start, delta);
        expanded
    }

    /// Re-estimates an expanded comment whose reply count changed.
    fn refresh_expanded(&mut self, comment_id: &str) {
        if !self.expander.is_expanded(comment_id) {
            return;
        }
        let Some(node) = self.pagination.get(comment_id) else {
            return;
        };
        let shape = node.shape(true);
        let Some(index) = self.viewport.rows.index_of(comment_id) else {
            return;
        };
        let start = self.viewport.rows.start_of(index);
        if let Some(delta) = self.viewport.rows.invalidate(comment_id, shape) {
            self.viewport.anchor(start, delta);
        }
    }

    pub fn toggle_vote(&mut self, comment_id: &str, direction: Vote) -> Option<MutationTicket> {
        if !self.is_alive() {
            return None;
        }
        let node = find_comment(&self.pagination, comment_id)?;
        let ticket = self.engagement.toggle_vote(node, direction)?;
        submit_mutation(
            &self.services,
            &self.alive,
            &self.response_tx,
            ticket.clone(),
            |ticket, result| ThreadResponse::Mutation { ticket, result },
        );
        Some(ticket)
    }

    pub fn toggle_bookmark(&mut self, comment_id: &str) -> Option<MutationTicket> {
        if !self.is_alive() {
            return None;
        }
        let node = find_comment(&self.pagination, comment_id)?;
        let ticket = self.engagement.toggle_bookmark(node)?;
        submit_mutation(
            &self.services,
            &self.alive,
            &self.response_tx,
            ticket.clone(),
            |ticket, result| ThreadResponse::Mutation { ticket, result },
        );
        Some(ticket)
    }

    /// Posts a comment, or a reply when `parent_id` is set. The comment appears once the
    /// backend accepts it.
    pub fn submit_comment(&mut self, content: &str, parent_id: Option<&str>) -> bool {
        if !self.is_alive() {
            return false;
        }
        let content = content.trim().to_string();
        if content.is_empty() {
            return false;
        }
        let comments = Arc::clone(&self.services.comments);
        let post_id = self.post_id.clone();
        let parent_id = parent_id.map(str::to_string);
        let alive = Arc::clone(&self.alive);
        let tx = self.response_tx.clone();
        self.services.spawner.spawn(Box::new(move || {
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            let result = comments.submit_comment(&post_id, &content, parent_id.as_deref());
            let _ = tx.send(ThreadResponse::Comment { result });
        }));
        true
    }

    /// Removes a comment or reply from the local list.
    pub fn remove_comment(&mut self, comment_id: &str) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.pagination.remove(comment_id).is_some() {
            let pagination = &self.pagination;
            self.expander
                .retain(|id| pagination.get(id).is_some());
            self.engagement.clear_failed(comment_id);
            self.sync_rows();
            return true;
        }
        let Some(owner) = top_level_owner(&self.pagination, comment_id) else {
            return false;
        };
        if let Some(parent) = self.pagination.get_mut(&owner) {
            parent.replies.retain(|reply| reply.id != comment_id);
            parent.reply_count = parent.reply_count.saturating_sub(1);
        }
        self.refresh_expanded(&owner);
        true
    }

    pub fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            if !self.is_alive() {
                continue;
            }
            self.handle_response(message);
            changed = true;
        }
        changed
    }

    fn handle_response(&mut self, message: ThreadResponse) {
        match message {
            ThreadResponse::Page { ticket, result } => match result {
                Ok(page) => {
                    let nodes = page.items.into_iter().map(CommentNode::flattened).collect();
                    let engagement = &self.engagement;
                    let applied = self.pagination.complete_fetch(
                        ticket,
                        nodes,
                        page.has_more,
                        |id| engagement.is_pending(id),
                    );
                    if applied.is_ok() {
                        self.sync_rows();
                    }
                }
                Err(err) => {
                    let message = format!("Could not load comments: {err}");
                    if self.pagination.fail_fetch(ticket, err).is_ok() {
                        warn!("{message}");
                        self.notices
                            .push(Notice::new(NoticeKind::FetchFailed, message));
                    }
                }
            },
            ThreadResponse::Replies { comment_id, result } => {
                if !self.loading_replies.remove(&comment_id) {
                    return;
                }
                match result {
                    Ok(replies) => {
                        let Some(node) = self.pagination.get_mut(&comment_id) else {
                            return;
                        };
                        let mut holder = node.clone();
                        holder.replies = replies;
                        holder.reply_count = 0;
                        let holder = holder.flattened();
                        node.reply_count = holder.replies.len();
                        node.replies = holder.replies;
                        self.refresh_expanded(&comment_id);
                    }
                    Err(err) => {
                        if self.expander.is_expanded(&comment_id) {
                            let reply_count = self
                                .pagination
                                .get(&comment_id)
                                .map(|node| node.reply_count)
                                .unwrap_or(0);
                            self.toggle_row(&comment_id, reply_count);
                        }
                        self.notices.push(Notice::new(
                            NoticeKind::FetchFailed,
                            format!("Could not load replies: {err}"),
                        ));
                    }
                }
            }
            ThreadResponse::Mutation { ticket, result } => {
                let resolution = self.engagement.resolve(&ticket, result);
                let item = find_comment_mut(&mut self.pagination, &ticket.item_id)
                    .map(|node| node as &mut dyn Engageable);
                if let Some(next) = settle(resolution, item, settlement_label, &mut self.notices) {
                    submit_mutation(
                        &self.services,
                        &self.alive,
                        &self.response_tx,
                        next,
                        |ticket, result| ThreadResponse::Mutation { ticket, result },
                    );
                }
            }
            ThreadResponse::Comment { result } => match result {
                Ok(node) => self.insert_comment(node),
                Err(err) => self.notices.push(Notice::new(
                    NoticeKind::CommentFailed,
                    format!("Could not post comment: {err}"),
                )),
            },
        }
    }

    fn insert_comment(&mut self, node: CommentNode) {
        let owner = node
            .parent_id
            .as_deref()
            .and_then(|parent| top_level_owner(&self.pagination, parent));
        match owner {
            None => {
                self.pagination.upsert(node.flattened());
                self.sync_rows();
            }
            Some(owner) => {
                if let Some(parent) = self.pagination.get_mut(&owner) {
                    let loaded = parent.replies_loaded();
                    parent.reply_count += 1;
                    if loaded {
                        let mut reply = node;
                        reply.parent_id = Some(owner.clone());
                        parent.replies.push(reply);
                    }
                }
                self.refresh_expanded(&owner);
            }
        }
    }

    fn sync_rows(&mut self) {
        let expander = &self.expander;
        let rows: Vec<_> = self
            .pagination
            .items()
            .iter()
            .map(|node| (node.id.clone(), node.shape(expander.is_expanded(&node.id))))
            .collect();
        self.viewport.rows.set_rows(rows);
        self.viewport.scroll_to(self.viewport.scroll_offset);
    }

    pub fn unmount(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!(post = %self.post_id, "thread view unmounted");
        }
    }
}

impl Drop for ThreadView {
    fn drop(&mut self) {
        self.unmount();
    }
}
