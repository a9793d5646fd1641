use std::collections::HashSet;
use std::time::Instant;

use proptest::prelude::*;

use spacefeed::engagement::{apply_vote, EngagementStore, Resolution};
use spacefeed::error::MutationError;
use spacefeed::model::{Keyed, MediaAttachment, Post, Vote, VoteTally};
use spacefeed::pagination::PaginationController;
use spacefeed::playback::{HeadlessElement, MediaPlaybackController, PlaybackConfig};
use spacefeed::size_cache::{Estimator, RowShape};
use spacefeed::virtualizer::WindowVirtualizer;

#[derive(Debug, Clone, PartialEq)]
struct Item {
    id: String,
}

impl Keyed for Item {
    fn key(&self) -> &str {
        &self.id
    }
}

fn item(n: u16) -> Item {
    Item {
        id: format!("i{n}"),
    }
}

fn post(up: i64, down: i64) -> Post {
    Post {
        id: "p".into(),
        title: String::new(),
        body: String::new(),
        author: String::new(),
        space: String::new(),
        created_at: Default::default(),
        votes_up: up,
        votes_down: down,
        current_user_vote: Vote::None,
        bookmarked: false,
        comments_count: 0,
        media: Vec::new(),
    }
}

fn vote_strategy() -> impl Strategy<Value = Vote> {
    prop_oneof![Just(Vote::Up), Just(Vote::Down)]
}

fn virtualizer_with(rows: &[(bool, usize)], measured: &[Option<u16>]) -> WindowVirtualizer {
    let mut v = WindowVirtualizer::new(Estimator::default());
    v.set_rows(rows.iter().enumerate().map(|(i, (has_media, replies))| {
        (
            format!("r{i}"),
            RowShape {
                has_media: *has_media,
                expanded_replies: *replies,
            },
        )
    }));
    for (i, height) in measured.iter().enumerate().take(rows.len()) {
        if let Some(height) = height {
            v.measure(&format!("r{i}"), f64::from(*height) + 1.0)
                .expect("positive height");
        }
    }
    v
}

proptest! {
    #[test]
    fn visible_range_is_bounded_and_deterministic(
        rows in prop::collection::vec((any::<bool>(), 0usize..4), 1..60),
        measured in prop::collection::vec(prop::option::of(0u16..600), 0..60),
        scroll in 0.0f64..20_000.0,
        viewport in 0.0f64..2_000.0,
        overscan in 0usize..5,
    ) {
        let v = virtualizer_with(&rows, &measured);
        let first = v.visible_range(scroll, viewport, overscan);
        let second = v.visible_range(scroll, viewport, overscan);
        prop_assert_eq!(first, second);
        prop_assert!(!first.empty);
        prop_assert!(first.start <= first.end);
        prop_assert!(first.end < rows.len());

        let clamped = v.clamp_scroll(scroll, viewport);
        prop_assert!(clamped >= 0.0);
        prop_assert!(clamped <= (v.total_size() - viewport).max(0.0) + 1e-6);
    }

    #[test]
    fn total_size_matches_row_sizes(
        rows in prop::collection::vec((any::<bool>(), 0usize..4), 0..40),
        measured in prop::collection::vec(prop::option::of(0u16..600), 0..40),
    ) {
        let v = virtualizer_with(&rows, &measured);
        let sum: f64 = (0..v.len()).map(|i| v.size(i)).sum();
        prop_assert!((v.total_size() - sum).abs() < 1e-6);
        for i in 1..v.len() {
            prop_assert!((v.start_of(i) - (v.start_of(i - 1) + v.size(i - 1))).abs() < 1e-6);
        }
    }

    #[test]
    fn pages_never_duplicate_ids(
        pages in prop::collection::vec(prop::collection::vec(0u16..30, 0..8), 1..6),
    ) {
        let mut pager: PaginationController<Item> = PaginationController::new(8);
        for (n, page) in pages.iter().enumerate() {
            let ticket = pager.begin_fetch().expect("idle and has more");
            prop_assert!(pager.is_fetching());
            prop_assert!(!pager.should_fetch_next(0, pager.len(), usize::MAX));
            prop_assert!(pager.begin_fetch().is_none());
            let has_more = n + 1 < pages.len();
            let items = page.iter().copied().map(item).collect();
            prop_assert!(pager.complete_fetch(ticket, items, has_more, |_| false).is_ok());
        }
        let ids: HashSet<&str> = pager.items().iter().map(|i| i.id.as_str()).collect();
        prop_assert_eq!(ids.len(), pager.len());
        prop_assert!(!pager.has_more());
        prop_assert!(pager.begin_fetch().is_none());
    }

    #[test]
    fn optimistic_votes_track_the_transition_and_roll_back(
        up in 0i64..50,
        down in 0i64..50,
        moves in prop::collection::vec(vote_strategy(), 1..8),
    ) {
        let item = post(up, down);
        let mut store = EngagementStore::new();
        let mut expected = VoteTally { vote: Vote::None, up, down };
        let mut in_flight = None;
        for direction in &moves {
            let ticket = store.toggle_vote(&item, *direction);
            // Only the first toggle reaches the network; later ones are held.
            prop_assert_eq!(ticket.is_some(), in_flight.is_none());
            in_flight = in_flight.or(ticket);
            expected = apply_vote(expected, *direction);
            let view = store.view(&item);
            prop_assert_eq!(view.tally, expected);
            prop_assert!(view.vote_pending);
            prop_assert!(view.tally.up >= 0 && view.tally.down >= 0);
        }
        let mut sent = 0;
        while let Some(ticket) = in_flight.take() {
            sent += 1;
            prop_assert!(sent <= 2, "a held intent is sent at most once");
            if let Resolution::Continued { confirmed, next } =
                store.resolve(&ticket, Err(MutationError::Network("offline".into())))
            {
                prop_assert!(confirmed.is_none());
                in_flight = Some(next);
            }
        }
        let view = store.view(&item);
        prop_assert_eq!(view.tally, VoteTally { vote: Vote::None, up, down });
        prop_assert!(!view.vote_pending);
    }

    #[test]
    fn skips_stay_inside_the_media(
        duration in 1.0f64..7_200.0,
        skips in prop::collection::vec(any::<bool>(), 0..40),
    ) {
        let media = MediaAttachment::from_url("m", "https://cdn.test/clip.mp4");
        let mut player = MediaPlaybackController::new(
            &media,
            Box::new(HeadlessElement::default()),
            PlaybackConfig::default(),
        );
        let now = Instant::now();
        prop_assert!(player.tap_play(now).is_ok());
        player.on_metadata(duration);
        for forward in skips {
            if forward {
                player.skip_forward(now);
            } else {
                player.skip_backward(now);
            }
            let t = player.state().current_time;
            prop_assert!((0.0..=duration).contains(&t));
            prop_assert!((0.0..=1.0).contains(&player.progress()));
        }
    }
}
