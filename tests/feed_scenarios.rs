use std::sync::Arc;
use std::time::Instant;

use spacefeed::data::{DemoBackend, FeedFilters};
use spacefeed::dispatch::InlineSpawner;
use spacefeed::feed::{FeedView, HeadlessFactory, NoticeKind, Services, ThreadView, ViewOptions};
use spacefeed::model::Vote;
use spacefeed::playback::PlaybackStatus;

const FIXTURE: &str = r#"{
  "posts": [
    { "id": "a", "title": "First", "space": "rust", "votes_up": 4, "votes_down": 1 },
    { "id": "b", "title": "Second", "space": "rust", "media_urls": ["https://cdn.test/clip.mp4"] },
    { "id": "c", "title": "Third", "space": "music", "media_urls": ["https://youtu.be/dQw4w9WgXcQ"] }
  ],
  "comments": [
    {
      "id": "c1", "post_id": "a", "content": "top level", "reply_count": 2,
      "replies": [
        { "id": "c1-r0", "post_id": "a", "content": "first reply" },
        { "id": "c1-r1", "post_id": "a", "content": "second reply" }
      ]
    },
    { "id": "c2", "post_id": "a", "content": "no replies" }
  ]
}"#;

fn backend() -> Arc<DemoBackend> {
    Arc::new(DemoBackend::from_json(FIXTURE).expect("fixture parses"))
}

fn feed(backend: &Arc<DemoBackend>, page_size: usize) -> FeedView {
    let services = Services::from_backend(backend.clone(), Arc::new(InlineSpawner));
    let options = ViewOptions {
        page_size,
        ..ViewOptions::default()
    };
    FeedView::new(services, options, Box::new(HeadlessFactory))
}

fn ids(feed: &FeedView) -> Vec<&str> {
    feed.posts().iter().map(|post| post.id.as_str()).collect()
}

#[test]
fn pages_arrive_in_order_until_exhausted() {
    let backend = backend();
    let mut feed = feed(&backend, 2);

    assert!(feed.load_more());
    assert!(feed.is_fetching());
    assert!(!feed.load_more(), "second request while one is in flight");
    feed.poll_async();
    assert_eq!(ids(&feed), ["a", "b"]);
    assert!(feed.has_more());

    assert!(feed.load_more());
    feed.poll_async();
    assert_eq!(ids(&feed), ["a", "b", "c"]);
    assert!(!feed.has_more());

    assert!(!feed.load_more());
    assert!(!feed.is_fetching());
}

#[test]
fn viewport_near_the_end_fetches_next_page() {
    let backend = Arc::new(DemoBackend::seeded());
    let mut feed = feed(&backend, 5);
    feed.load_more();
    feed.poll_async();
    assert_eq!(feed.posts().len(), 5);

    feed.set_viewport_height(600.0);
    assert!(feed.is_fetching());
    feed.poll_async();
    assert_eq!(feed.posts().len(), 10);
}

#[test]
fn expanding_replies_grows_the_row_and_total() {
    let backend = backend();
    let services = Services::from_backend(backend, Arc::new(InlineSpawner));
    let mut thread = ThreadView::new("a", services, ViewOptions::default());
    thread.load_more();
    thread.poll_async();
    assert_eq!(thread.comments().len(), 2);

    let index = thread.virtualizer().index_of("c1").expect("c1 row");
    let before = thread.total_size();
    assert_eq!(thread.virtualizer().size(index), 140.0);

    assert_eq!(thread.toggle_replies("c1"), Some(true));
    assert_eq!(thread.virtualizer().size(index), 380.0);
    assert_eq!(thread.total_size(), before + 240.0);

    thread.poll_async();
    let node = thread.comment("c1").expect("c1");
    assert_eq!(node.replies.len(), 2);
    assert!(thread.comment("c1-r1").is_some());

    assert_eq!(thread.toggle_replies("c1"), Some(false));
    assert_eq!(thread.total_size(), before);
}

#[test]
fn expand_and_collapse_all_threads() {
    let backend = backend();
    let services = Services::from_backend(backend, Arc::new(InlineSpawner));
    let mut thread = ThreadView::new("a", services, ViewOptions::default());
    thread.load_more();
    thread.poll_async();
    let before = thread.total_size();

    assert_eq!(thread.expand_all_replies(), 1, "c2 has no replies");
    assert!(thread.is_expanded("c1"));
    assert!(!thread.is_expanded("c2"));
    assert_eq!(thread.total_size(), before + 240.0);
    thread.poll_async();
    assert!(thread.comment("c1-r0").is_some());
    assert_eq!(thread.expand_all_replies(), 0);

    assert_eq!(thread.collapse_all_replies(), 1);
    assert!(!thread.is_expanded("c1"));
    assert_eq!(thread.total_size(), before);
}

#[test]
fn failed_vote_is_rolled_back_with_a_notice() {
    let backend = backend();
    backend.set_fail_mutations(true);
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();

    assert!(feed.toggle_vote("a", Vote::Up).is_some());
    let optimistic = feed.engagement("a").expect("a");
    assert_eq!((optimistic.tally.up, optimistic.tally.vote), (5, Vote::Up));
    assert!(optimistic.vote_pending);

    feed.poll_async();
    let settled = feed.engagement("a").expect("a");
    assert_eq!((settled.tally.up, settled.tally.vote), (4, Vote::None));
    assert!(!settled.vote_pending);
    let notices = feed.take_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::MutationFailed);
    assert_eq!(backend.post("a").expect("a").votes_up, 4);
}

#[test]
fn vote_changes_reach_the_backend() {
    let backend = backend();
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();

    assert!(feed.toggle_vote("a", Vote::Up).is_some());
    assert!(feed.toggle_vote("a", Vote::Down).is_none());
    feed.poll_async();

    let view = feed.engagement("a").expect("a");
    assert_eq!(
        (view.tally.up, view.tally.down, view.tally.vote),
        (4, 2, Vote::Down)
    );
    let stored = backend.post("a").expect("a");
    assert_eq!((stored.votes_up, stored.votes_down), (4, 2));
    assert_eq!(stored.current_user_vote, Vote::Down);
    assert!(feed.take_notices().is_empty());
}

#[test]
fn rapid_bookmark_toggles_leave_backend_and_view_in_step() {
    let backend = backend();
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();

    backend.set_fail_mutations(true);
    feed.toggle_bookmark("a");
    backend.set_fail_mutations(false);
    feed.toggle_bookmark("a");
    feed.toggle_bookmark("a");
    while feed.poll_async() {}

    // The failed save was the newest intent, so it is rolled back once.
    let view = feed.engagement("a").expect("a");
    assert!(!view.bookmarked);
    assert!(!view.bookmark_pending);
    assert_eq!(backend.post("a").expect("a").bookmarked, view.bookmarked);
    assert_eq!(feed.take_notices().len(), 1);

    feed.toggle_bookmark("a");
    feed.toggle_bookmark("a");
    while feed.poll_async() {}
    let view = feed.engagement("a").expect("a");
    assert_eq!(backend.post("a").expect("a").bookmarked, view.bookmarked);
    assert!(!view.bookmarked);
}

#[test]
fn bookmarked_filter_shows_only_saved_posts() {
    let backend = backend();
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();

    feed.toggle_bookmark("b");
    feed.poll_async();
    assert!(feed.engagement("b").expect("b").bookmarked);

    feed.set_filters(FeedFilters {
        bookmarked_only: true,
        ..FeedFilters::default()
    });
    assert!(feed.posts().is_empty());
    feed.load_more();
    feed.poll_async();
    assert_eq!(ids(&feed), ["b"]);
}

#[test]
fn videos_play_independently_by_default() {
    let backend = backend();
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();
    feed.set_viewport_height(2000.0);

    let now = Instant::now();
    feed.play_media("b-m0", now).expect("b plays");
    feed.play_media("c-m0", now).expect("c plays");
    for id in ["b-m0", "c-m0"] {
        assert_eq!(
            feed.player(id).map(|p| p.status()),
            Some(PlaybackStatus::Playing)
        );
    }
    // Keyboard controls follow the most recently started item.
    let active = feed.active_player_mut().map(|p| p.media_id().to_string());
    assert_eq!(active.as_deref(), Some("c-m0"));
}

#[test]
fn exclusive_playback_pauses_the_previous_video() {
    let backend = backend();
    let services = Services::from_backend(backend.clone(), Arc::new(InlineSpawner));
    let options = ViewOptions {
        exclusive_playback: true,
        ..ViewOptions::default()
    };
    let mut feed = FeedView::new(services, options, Box::new(HeadlessFactory));
    feed.load_more();
    feed.poll_async();
    feed.set_viewport_height(2000.0);

    let now = Instant::now();
    feed.play_media("b-m0", now).expect("b plays");
    assert_eq!(
        feed.player("b-m0").map(|p| p.status()),
        Some(PlaybackStatus::Playing)
    );

    feed.play_media("c-m0", now).expect("c plays");
    assert_eq!(
        feed.player("b-m0").map(|p| p.status()),
        Some(PlaybackStatus::Paused)
    );
    assert_eq!(
        feed.player("c-m0").map(|p| p.status()),
        Some(PlaybackStatus::Playing)
    );
}

#[test]
fn unknown_media_is_reported() {
    let backend = backend();
    let mut feed = feed(&backend, 10);
    feed.load_more();
    feed.poll_async();
    assert!(feed.play_media("missing", Instant::now()).is_err());
}
