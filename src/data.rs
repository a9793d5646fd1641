use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engagement::apply_vote;
use crate::error::{FetchError, MutationError};
use crate::model::{CommentNode, Engageable, MediaAttachment, Post, Vote};
use crate::pagination::{Page, PageRequest};

pub trait FeedService: Send + Sync {
    fn fetch_page(&self, request: &PageRequest, filters: &FeedFilters)
        -> Result<Page<Post>, FetchError>;
}

pub trait CommentService: Send + Sync {
    /// Top-level comments of a post. Replies may be omitted; `reply_count` says how many exist.
    fn fetch_comments(
        &self,
        post_id: &str,
        request: &PageRequest,
    ) -> Result<Page<CommentNode>, FetchError>;
    fn fetch_replies(&self, comment_id: &str) -> Result<Vec<CommentNode>, FetchError>;
    fn submit_comment(
        &self,
        post_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentNode, MutationError>;
}

pub trait InteractionService: Send + Sync {
    /// Sets the user's vote to `vote`; `Vote::None` clears it.
    fn submit_vote(&self, item_id: &str, vote: Vote) -> Result<(), MutationError>;
    fn submit_bookmark_toggle(&self, item_id: &str) -> Result<(), MutationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSort {
    #[default]
    New,
    Top,
    Hot,
}

impl FeedSort {
    pub fn label(self) -> &'static str {
        match self {
            FeedSort::New => "new",
            FeedSort::Top => "top",
            FeedSort::Hot => "hot",
        }
    }

    pub fn next(self) -> Self {
        match self {
            FeedSort::New => FeedSort::Top,
            FeedSort::Top => FeedSort::Hot,
            FeedSort::Hot => FeedSort::New,
        }
    }
}

pub fn sort_from_key(key: &str) -> FeedSort {
    match key.trim().to_ascii_lowercase().as_str() {
        "top" => FeedSort::Top,
        "hot" => FeedSort::Hot,
        _ => FeedSort::New,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedFilters {
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub sort: FeedSort,
    #[serde(default)]
    pub bookmarked_only: bool,
}

impl FeedFilters {
    fn matches(&self, post: &Post) -> bool {
        if self.bookmarked_only && !post.bookmarked {
            return false;
        }
        match &self.space {
            Some(space) => post.space.eq_ignore_ascii_case(space.trim_start_matches("s/")),
            None => true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    posts: Vec<FixturePost>,
    #[serde(default)]
    comments: Vec<CommentNode>,
}

#[derive(Debug, Deserialize)]
struct FixturePost {
    #[serde(flatten)]
    post: Post,
    #[serde(default)]
    media_urls: Vec<String>,
}

#[derive(Debug, Default)]
struct DemoState {
    posts: Vec<Post>,
    comments: HashMap<String, Vec<CommentNode>>,
    replies: HashMap<String, Vec<CommentNode>>,
}

impl DemoState {
    fn insert_comment(&mut self, node: CommentNode) {
        let node = node.flattened();
        let mut top = node.clone();
        top.replies.clear();
        if !node.replies.is_empty() {
            self.replies.insert(node.id.clone(), node.replies);
        }
        self.comments.entry(top.post_id.clone()).or_default().push(top);
    }

    fn engageable_mut(&mut self, item_id: &str) -> Option<&mut dyn Engageable> {
        if let Some(post) = self.posts.iter_mut().find(|post| post.id == item_id) {
            return Some(post);
        }
        let comment = self
            .comments
            .values_mut()
            .chain(self.replies.values_mut())
            .flat_map(|nodes| nodes.iter_mut())
            .find(|node| node.id == item_id)?;
        Some(comment)
    }
}

/// In-memory backend for the terminal host and tests. Seeded with built-in posts or a
/// JSON fixture; latency and failures can be injected.
pub struct DemoBackend {
    state: Mutex<DemoState>,
    latency: Duration,
    fail_mutations: AtomicBool,
    fail_fetches: AtomicBool,
}

impl Default for DemoBackend {
    fn default() -> Self {
        Self::seeded()
    }
}

impl DemoBackend {
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(DemoState::default()),
            latency: Duration::ZERO,
            fail_mutations: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
        }
    }

    pub fn seeded() -> Self {
        let backend = Self::empty();
        {
            let mut state = backend.state.lock();
            state.posts = seed_posts();
            for comment in seed_comments(&state.posts) {
                state.insert_comment(comment);
            }
        }
        backend
    }

    pub fn from_posts(posts: Vec<Post>) -> Self {
        let backend = Self::empty();
        backend.state.lock().posts = posts;
        backend
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(raw).context("parse fixture JSON")?;
        let backend = Self::empty();
        {
            let mut state = backend.state.lock();
            for entry in fixture.posts {
                let mut post = entry.post;
                for (index, raw) in entry.media_urls.iter().enumerate() {
                    post.media
                        .push(MediaAttachment::from_url(format!("{}-m{index}", post.id), raw));
                }
                state.posts.push(post);
            }
            for comment in fixture.comments {
                state.insert_comment(comment);
            }
        }
        Ok(backend)
    }

    pub fn from_fixture(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read fixture {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("load fixture {}", path.display()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn post(&self, id: &str) -> Option<Post> {
        self.state.lock().posts.iter().find(|post| post.id == id).cloned()
    }

    pub fn post_count(&self) -> usize {
        self.state.lock().posts.len()
    }

    fn simulate_latency(&self) {
        if self.latency.is_zero() {
            return;
        }
        let jitter_ms = (self.latency.as_millis() / 4) as u64;
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        thread::sleep(self.latency + Duration::from_millis(extra));
    }

    fn check_fetch(&self) -> Result<(), FetchError> {
        self.simulate_latency();
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(FetchError::Network("demo backend is offline".into()));
        }
        Ok(())
    }

    fn check_mutation(&self) -> Result<(), MutationError> {
        self.simulate_latency();
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(MutationError::Network("demo backend is offline".into()));
        }
        Ok(())
    }
}

impl FeedService for DemoBackend {
    fn fetch_page(
        &self,
        request: &PageRequest,
        filters: &FeedFilters,
    ) -> Result<Page<Post>, FetchError> {
        self.check_fetch()?;
        let state = self.state.lock();
        let mut matching: Vec<&Post> = state
            .posts
            .iter()
            .filter(|post| filters.matches(post))
            .collect();
        sort_posts(&mut matching, filters.sort);
        Ok(slice_page(&matching, request))
    }
}

impl CommentService for DemoBackend {
    fn fetch_comments(
        &self,
        post_id: &str,
        request: &PageRequest,
    ) -> Result<Page<CommentNode>, FetchError> {
        self.check_fetch()?;
        let state = self.state.lock();
        if !state.posts.iter().any(|post| post.id == post_id) {
            return Err(FetchError::NotFound(format!("post {post_id}")));
        }
        let comments: Vec<&CommentNode> = state
            .comments
            .get(post_id)
            .map(|nodes| nodes.iter().collect())
            .unwrap_or_default();
        Ok(slice_page(&comments, request))
    }

    fn fetch_replies(&self, comment_id: &str) -> Result<Vec<CommentNode>, FetchError> {
        self.check_fetch()?;
        let state = self.state.lock();
        Ok(state.replies.get(comment_id).cloned().unwrap_or_default())
    }

    fn submit_comment(
        &self,
        post_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<CommentNode, MutationError> {
        self.check_mutation()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(MutationError::Rejected("comment is empty".into()));
        }
        let mut state = self.state.lock();
        if !state.posts.iter().any(|post| post.id == post_id) {
            return Err(MutationError::Rejected(format!("unknown post {post_id}")));
        }
        let node = CommentNode {
            id: local_id("c"),
            post_id: post_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            author: "you".into(),
            content: content.to_string(),
            created_at: Utc::now(),
            votes_up: 0,
            votes_down: 0,
            current_user_vote: Vote::None,
            bookmarked: false,
            reply_count: 0,
            replies: Vec::new(),
        };
        match parent_id {
            Some(parent) => {
                let parent_node = state
                    .comments
                    .get_mut(post_id)
                    .and_then(|nodes| nodes.iter_mut().find(|node| node.id == parent))
                    .ok_or_else(|| MutationError::Rejected(format!("unknown comment {parent}")))?;
                parent_node.reply_count += 1;
                state
                    .replies
                    .entry(parent.to_string())
                    .or_default()
                    .push(node.clone());
            }
            None => state
                .comments
                .entry(post_id.to_string())
                .or_default()
                .push(node.clone()),
        }
        if let Some(post) = state.posts.iter_mut().find(|post| post.id == post_id) {
            post.comments_count += 1;
        }
        Ok(node)
    }
}

impl InteractionService for DemoBackend {
    fn submit_vote(&self, item_id: &str, vote: Vote) -> Result<(), MutationError> {
        self.check_mutation()?;
        let mut state = self.state.lock();
        let item = state
            .engageable_mut(item_id)
            .ok_or_else(|| MutationError::Rejected(format!("unknown item {item_id}")))?;
        let tally = item.tally();
        if tally.vote != vote {
            item.set_tally(apply_vote(tally, vote));
        }
        Ok(())
    }

    fn submit_bookmark_toggle(&self, item_id: &str) -> Result<(), MutationError> {
        self.check_mutation()?;
        let mut state = self.state.lock();
        let item = state
            .engageable_mut(item_id)
            .ok_or_else(|| MutationError::Rejected(format!("unknown item {item_id}")))?;
        let bookmarked = item.bookmarked();
        item.set_bookmarked(!bookmarked);
        Ok(())
    }
}

fn slice_page<T: Clone>(all: &[&T], request: &PageRequest) -> Page<T> {
    let start = request.offset.min(all.len());
    let end = (start + request.page_size).min(all.len());
    Page {
        items: all[start..end].iter().map(|item| (*item).clone()).collect(),
        has_more: end < all.len(),
    }
}

fn sort_posts(posts: &mut [&Post], sort: FeedSort) {
    match sort {
        FeedSort::New => posts.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        FeedSort::Top => posts.sort_by(|a, b| b.score().cmp(&a.score())),
        FeedSort::Hot => {
            let newest = posts
                .iter()
                .map(|post| post.created_at)
                .max()
                .unwrap_or_default();
            posts.sort_by(|a, b| hotness(b, newest).total_cmp(&hotness(a, newest)));
        }
    }
}

/// Score decayed by age relative to the newest post, so the order does not drift with
/// the wall clock.
fn hotness(post: &Post, newest: DateTime<Utc>) -> f64 {
    let age_hours = (newest - post.created_at).num_minutes().max(0) as f64 / 60.0;
    post.score() as f64 / (age_hours + 2.0).powf(1.5)
}

fn local_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{prefix}-{}", suffix.to_lowercase())
}

const SEED_EPOCH: i64 = 1_714_564_800;

const SEED_SPACES: [&str; 4] = ["rust", "space", "music", "cooking"];

const SEED_MEDIA: [(&str, &str); 4] = [
    ("Launch replay", "https://www.youtube.com/watch?v=21X5lGlDOfg"),
    ("Tiny kitchen trick", "https://www.tiktok.com/@chef/video/7234567890123456789"),
    ("Timelapse", "https://cdn.spacefeed.test/media/timelapse.mp4"),
    ("Album cover", "https://cdn.spacefeed.test/media/cover.jpg"),
];

fn seed_posts() -> Vec<Post> {
    (0..36)
        .map(|index| {
            let space = SEED_SPACES[index % SEED_SPACES.len()];
            let created_at = DateTime::<Utc>::from_timestamp(SEED_EPOCH - index as i64 * 2_700, 0)
                .unwrap_or_default();
            let id = format!("p{index:03}");
            let (title, media) = if index % 3 == 0 {
                let (title, url) = SEED_MEDIA[(index / 3) % SEED_MEDIA.len()];
                (
                    format!("{title} #{index}"),
                    vec![MediaAttachment::from_url(format!("{id}-m0"), url)],
                )
            } else {
                (format!("Thoughts on {space}, part {index}"), Vec::new())
            };
            Post {
                body: format!(
                    "Post {index} in s/{space}. Scroll on; more loads as you get near the end."
                ),
                title,
                author: format!("user{}", index % 7),
                space: space.to_string(),
                created_at,
                votes_up: ((index * 37) % 101) as i64,
                votes_down: ((index * 11) % 17) as i64,
                current_user_vote: Vote::None,
                bookmarked: index % 9 == 4,
                comments_count: 0,
                media,
                id,
            }
        })
        .collect()
}

fn seed_comments(posts: &[Post]) -> Vec<CommentNode> {
    let mut out = Vec::new();
    for (post_index, post) in posts.iter().enumerate() {
        for n in 0..(post_index % 4 + 1) {
            let id = format!("{}-c{n}", post.id);
            let replies: Vec<CommentNode> = (0..(n + post_index) % 3)
                .map(|r| seed_comment(&format!("{id}-r{r}"), &post.id, Some(&id), r))
                .collect();
            let mut node = seed_comment(&id, &post.id, None, n);
            node.reply_count = replies.len();
            node.replies = replies;
            out.push(node);
        }
    }
    out
}

fn seed_comment(id: &str, post_id: &str, parent_id: Option<&str>, n: usize) -> CommentNode {
    CommentNode {
        id: id.to_string(),
        post_id: post_id.to_string(),
        parent_id: parent_id.map(str::to_string),
        author: format!("commenter{}", n % 5),
        content: format!("Comment {id}: agreed, with one small caveat."),
        created_at: DateTime::<Utc>::from_timestamp(SEED_EPOCH + n as i64 * 60, 0)
            .unwrap_or_default(),
        votes_up: (n * 3) as i64,
        votes_down: 0,
        current_user_vote: Vote::None,
        bookmarked: false,
        reply_count: 0,
        replies: Vec::new(),
    }
}
