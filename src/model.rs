use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::size_cache::RowShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
    #[default]
    None,
}

impl Vote {
    pub fn as_str(self) -> &'static str {
        match self {
            Vote::Up => "up",
            Vote::Down => "down",
            Vote::None => "none",
        }
    }
}

/// Vote counts together with the current user's vote, the unit the engagement store
/// snapshots and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteTally {
    pub vote: Vote,
    pub up: i64,
    pub down: i64,
}

impl VoteTally {
    pub fn score(&self) -> i64 {
        self.up - self.down
    }
}

pub trait Keyed {
    fn key(&self) -> &str;
}

/// Anything the user can vote on or bookmark.
pub trait Engageable: Keyed {
    fn tally(&self) -> VoteTally;
    fn set_tally(&mut self, tally: VoteTally);
    fn bookmarked(&self) -> bool;
    fn set_bookmarked(&mut self, bookmarked: bool);
}

/// A row the virtualizer can estimate before it is measured.
pub trait Row: Keyed {
    fn shape(&self, expanded: bool) -> RowShape;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub space: String,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub votes_up: i64,
    #[serde(default)]
    pub votes_down: i64,
    #[serde(default)]
    pub current_user_vote: Vote,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub comments_count: i64,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

impl Post {
    pub fn score(&self) -> i64 {
        self.votes_up - self.votes_down
    }

    pub fn playable_media(&self) -> impl Iterator<Item = &MediaAttachment> {
        self.media.iter().filter(|media| media.kind.is_playable())
    }

    pub fn find_media(&self, media_id: &str) -> Option<&MediaAttachment> {
        self.media.iter().find(|media| media.id == media_id)
    }
}

impl Keyed for Post {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Engageable for Post {
    fn tally(&self) -> VoteTally {
        VoteTally {
            vote: self.current_user_vote,
            up: self.votes_up,
            down: self.votes_down,
        }
    }

    fn set_tally(&mut self, tally: VoteTally) {
        self.current_user_vote = tally.vote;
        self.votes_up = tally.up;
        self.votes_down = tally.down;
    }

    fn bookmarked(&self) -> bool {
        self.bookmarked
    }

    fn set_bookmarked(&mut self, bookmarked: bool) {
        self.bookmarked = bookmarked;
    }
}

impl Row for Post {
    fn shape(&self, _expanded: bool) -> RowShape {
        RowShape {
            has_media: !self.media.is_empty(),
            expanded_replies: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentNode {
    pub id: String,
    #[serde(default)]
    pub post_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub votes_up: i64,
    #[serde(default)]
    pub votes_down: i64,
    #[serde(default)]
    pub current_user_vote: Vote,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub reply_count: usize,
    #[serde(default)]
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// Hoists replies-to-replies so the node carries a single level of nesting.
    pub fn flattened(mut self) -> Self {
        let mut flat = Vec::with_capacity(self.replies.len());
        let mut stack: Vec<CommentNode> = self.replies.drain(..).rev().collect();
        while let Some(mut reply) = stack.pop() {
            let nested: Vec<CommentNode> = reply.replies.drain(..).collect();
            reply.reply_count = 0;
            reply.parent_id = Some(self.id.clone());
            flat.push(reply);
            stack.extend(nested.into_iter().rev());
        }
        self.replies = flat;
        self.reply_count = self.reply_count.max(self.replies.len());
        self
    }

    pub fn replies_loaded(&self) -> bool {
        self.reply_count == 0 || !self.replies.is_empty()
    }

    pub fn score(&self) -> i64 {
        self.votes_up - self.votes_down
    }
}

impl Keyed for CommentNode {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Engageable for CommentNode {
    fn tally(&self) -> VoteTally {
        VoteTally {
            vote: self.current_user_vote,
            up: self.votes_up,
            down: self.votes_down,
        }
    }

    fn set_tally(&mut self, tally: VoteTally) {
        self.current_user_vote = tally.vote;
        self.votes_up = tally.up;
        self.votes_down = tally.down;
    }

    fn bookmarked(&self) -> bool {
        self.bookmarked
    }

    fn set_bookmarked(&mut self, bookmarked: bool) {
        self.bookmarked = bookmarked;
    }
}

impl Row for CommentNode {
    fn shape(&self, expanded: bool) -> RowShape {
        RowShape {
            has_media: false,
            expanded_replies: if expanded { self.reply_count } else { 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedProvider {
    YouTube,
    TikTok,
}

impl EmbedProvider {
    pub fn watch_url(self, video_id: &str) -> String {
        match self {
            EmbedProvider::YouTube => format!("https://www.youtube.com/watch?v={video_id}"),
            EmbedProvider::TikTok => format!("https://www.tiktok.com/embed/v2/{video_id}"),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EmbedProvider::YouTube => "YouTube",
            EmbedProvider::TikTok => "TikTok",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Embed {
        provider: EmbedProvider,
        video_id: String,
    },
}

impl MediaKind {
    pub fn is_playable(&self) -> bool {
        !matches!(self, MediaKind::Image)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub id: String,
    pub url: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "webm", "mov", "m4v", "m3u8"];

impl MediaAttachment {
    pub fn from_url(id: impl Into<String>, raw: &str) -> Self {
        let url = raw.trim().replace("&amp;", "&");
        let kind = classify_url(&url);
        Self {
            id: id.into(),
            url,
            kind,
            poster: None,
            width: None,
            height: None,
        }
    }

    /// URL a player should open for this attachment.
    pub fn playback_url(&self) -> String {
        match &self.kind {
            MediaKind::Embed { provider, video_id } => provider.watch_url(video_id),
            _ => self.url.clone(),
        }
    }

    pub fn label(&self) -> String {
        match &self.kind {
            MediaKind::Image => "image".to_string(),
            MediaKind::Video => "video".to_string(),
            MediaKind::Embed { provider, .. } => format!("{} embed", provider.display_name()),
        }
    }
}

fn classify_url(raw: &str) -> MediaKind {
    let Ok(url) = Url::parse(raw) else {
        return MediaKind::Image;
    };
    if let Some((provider, video_id)) = embed_from_url(&url) {
        return MediaKind::Embed { provider, video_id };
    }
    let is_video = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .is_some_and(|(_, ext)| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        });
    if is_video {
        MediaKind::Video
    } else {
        MediaKind::Image
    }
}

fn embed_from_url(url: &Url) -> Option<(EmbedProvider, String)> {
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match host {
        "youtube.com" | "youtube-nocookie.com" => {
            let id = match segments.as_slice() {
                ["watch"] => url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .map(|(_, value)| value.into_owned()),
                ["shorts", id, ..] | ["embed", id, ..] | ["live", id, ..] => Some(id.to_string()),
                _ => None,
            }?;
            non_empty(id).map(|id| (EmbedProvider::YouTube, id))
        }
        "youtu.be" => segments
            .first()
            .and_then(|id| non_empty(id.to_string()))
            .map(|id| (EmbedProvider::YouTube, id)),
        "tiktok.com" => match segments.as_slice() {
            [user, "video", id, ..] if user.starts_with('@') => {
                non_empty(id.to_string()).map(|id| (EmbedProvider::TikTok, id))
            }
            ["embed", "v2", id, ..] | ["embed", id, ..] => {
                non_empty(id.to_string()).map(|id| (EmbedProvider::TikTok, id))
            }
            _ => None,
        },
        _ => None,
    }
}

fn non_empty(id: String) -> Option<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, replies: Vec<CommentNode>) -> CommentNode {
        CommentNode {
            id: id.into(),
            post_id: "p1".into(),
            parent_id: None,
            author: "someone".into(),
            content: String::new(),
            created_at: epoch(),
            votes_up: 0,
            votes_down: 0,
            current_user_vote: Vote::None,
            bookmarked: false,
            reply_count: replies.len(),
            replies,
        }
    }

    #[test]
    fn detects_youtube_variants() {
        for raw in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ] {
            let media = MediaAttachment::from_url("m", raw);
            assert_eq!(
                media.kind,
                MediaKind::Embed {
                    provider: EmbedProvider::YouTube,
                    video_id: "dQw4w9WgXcQ".into()
                },
                "url was {raw}"
            );
        }
    }

    #[test]
    fn detects_tiktok_video() {
        let media =
            MediaAttachment::from_url("m", "https://www.tiktok.com/@creator/video/7234567890123");
        assert_eq!(
            media.kind,
            MediaKind::Embed {
                provider: EmbedProvider::TikTok,
                video_id: "7234567890123".into()
            }
        );
        assert!(media.playback_url().contains("7234567890123"));
    }

    #[test]
    fn classifies_native_video_and_images() {
        let video = MediaAttachment::from_url("v", "https://cdn.test/clip.MP4?sig=a&amp;b=1");
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.url, "https://cdn.test/clip.MP4?sig=a&b=1");

        let image = MediaAttachment::from_url("i", "https://cdn.test/photo.jpg");
        assert_eq!(image.kind, MediaKind::Image);
        assert!(!image.kind.is_playable());

        let junk = MediaAttachment::from_url("j", "not a url");
        assert_eq!(junk.kind, MediaKind::Image);
    }

    #[test]
    fn youtube_watch_without_id_is_not_an_embed() {
        let media = MediaAttachment::from_url("m", "https://www.youtube.com/watch");
        assert_eq!(media.kind, MediaKind::Image);
    }

    #[test]
    fn flattening_hoists_nested_replies_in_order() {
        let nested = comment("c3", vec![comment("c4", vec![])]);
        let root = comment("c1", vec![comment("c2", vec![]), nested]).flattened();
        let ids: Vec<&str> = root.replies.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c2", "c3", "c4"]);
        assert!(root
            .replies
            .iter()
            .all(|reply| reply.parent_id.as_deref() == Some("c1") && reply.replies.is_empty()));
        assert_eq!(root.reply_count, 3);
    }

    #[test]
    fn comment_shape_counts_replies_only_when_expanded() {
        let node = comment("c1", vec![comment("c2", vec![]), comment("c3", vec![])]);
        assert_eq!(node.shape(false).expanded_replies, 0);
        assert_eq!(node.shape(true).expanded_replies, 2);
    }
}
