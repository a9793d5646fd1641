use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::MutationError;
use crate::model::{Engageable, Vote, VoteTally};

pub type MutationId = u64;

/// Lifecycle of one optimistic facet. `original` is the value the server is known to
/// hold; rollback is always a copy of it.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingState<T> {
    Idle,
    Pending { mutation_id: MutationId, original: T },
    Failed { original: T },
}

/// One optimistic value. At most one request per facet is on the wire; toggles made
/// while it is in flight only move `value` and are sent once it resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct Facet<T> {
    pub value: T,
    pub state: PendingState<T>,
    sent: T,
}

impl<T: Clone + PartialEq> Facet<T> {
    fn new(value: T) -> Self {
        Self {
            sent: value.clone(),
            value,
            state: PendingState::Idle,
        }
    }

    fn pending_id(&self) -> Option<MutationId> {
        match self.state {
            PendingState::Pending { mutation_id, .. } => Some(mutation_id),
            _ => None,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_id().is_some()
    }

    /// Moves the optimistic value to `next`. Returns whether a request has to go out
    /// now; while one is in flight the intent is held instead.
    fn begin(&mut self, mutation_id: MutationId, next: T) -> bool {
        if self.is_pending() {
            self.value = next;
            return false;
        }
        let original = std::mem::replace(&mut self.value, next.clone());
        self.sent = next;
        self.state = PendingState::Pending {
            mutation_id,
            original,
        };
        true
    }

    /// Applies the result of the in-flight request. `follow_up_id` is used when a held
    /// intent still differs from what the server now holds.
    fn resolve(
        &mut self,
        mutation_id: MutationId,
        result: &Result<(), MutationError>,
        follow_up_id: MutationId,
    ) -> FacetOutcome<T> {
        if self.pending_id() != Some(mutation_id) {
            return FacetOutcome::Stale;
        }
        let state = std::mem::replace(&mut self.state, PendingState::Idle);
        let PendingState::Pending { original, .. } = state else {
            return FacetOutcome::Stale;
        };
        let server = if result.is_ok() {
            self.sent.clone()
        } else {
            original
        };
        if self.value == server {
            return FacetOutcome::Settled(server);
        }
        if self.value != self.sent {
            self.sent = self.value.clone();
            self.state = PendingState::Pending {
                mutation_id: follow_up_id,
                original: server.clone(),
            };
            return FacetOutcome::Continued {
                confirmed: result.is_ok().then_some(server),
                target: self.sent.clone(),
            };
        }
        self.value = server.clone();
        self.state = PendingState::Failed {
            original: server.clone(),
        };
        FacetOutcome::RolledBack(server)
    }
}

enum FacetOutcome<T> {
    Settled(T),
    RolledBack(T),
    Continued { confirmed: Option<T>, target: T },
    Stale,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngagementRecord {
    pub item_id: String,
    pub vote: Option<Facet<VoteTally>>,
    pub bookmark: Option<Facet<bool>>,
}

impl EngagementRecord {
    pub fn pending_mutation_id(&self) -> Option<MutationId> {
        self.vote
            .as_ref()
            .and_then(Facet::pending_id)
            .or_else(|| self.bookmark.as_ref().and_then(Facet::pending_id))
    }

    fn is_pending(&self) -> bool {
        self.vote.as_ref().is_some_and(Facet::is_pending)
            || self.bookmark.as_ref().is_some_and(Facet::is_pending)
    }

    fn is_empty(&self) -> bool {
        self.vote.is_none() && self.bookmark.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationRequest {
    SetVote(Vote),
    ToggleBookmark,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTicket {
    pub item_id: String,
    pub mutation_id: MutationId,
    pub request: MutationRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Vote(VoteTally),
    Bookmark(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The server holds the value the user last asked for; it is now authoritative.
    Settled(Settlement),
    /// The mutation failed and the optimistic value was replaced by this snapshot.
    RolledBack(Settlement, MutationError),
    /// A newer intent was held behind the finished request and `next` must be sent.
    /// `confirmed` is what the server accepted, when the request succeeded.
    Continued {
        confirmed: Option<Settlement>,
        next: MutationTicket,
    },
    /// Not the in-flight request of its facet; nothing changed.
    Stale,
}

/// What the UI should display for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementView {
    pub tally: VoteTally,
    pub bookmarked: bool,
    pub vote_pending: bool,
    pub bookmark_pending: bool,
    pub failed: bool,
}

/// Vote transition: repeating the current direction clears the vote, otherwise the
/// vote moves to `direction`, replacing an opposite vote.
pub fn apply_vote(tally: VoteTally, direction: Vote) -> VoteTally {
    let next = if tally.vote == direction {
        Vote::None
    } else {
        direction
    };
    let mut out = tally;
    match tally.vote {
        Vote::Up => out.up -= 1,
        Vote::Down => out.down -= 1,
        Vote::None => {}
    }
    match next {
        Vote::Up => out.up += 1,
        Vote::Down => out.down += 1,
        Vote::None => {}
    }
    out.vote = next;
    out
}

#[derive(Debug, Default)]
pub struct EngagementStore {
    records: HashMap<String, EngagementRecord>,
    next_mutation_id: MutationId,
}

impl EngagementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, item_id: &str) -> Option<&EngagementRecord> {
        self.records.get(item_id)
    }

    pub fn is_pending(&self, item_id: &str) -> bool {
        self.records
            .get(item_id)
            .is_some_and(EngagementRecord::is_pending)
    }

    fn peek_id(&self) -> MutationId {
        self.next_mutation_id.wrapping_add(1)
    }

    fn take_id(&mut self) -> MutationId {
        self.next_mutation_id = self.peek_id();
        self.next_mutation_id
    }

    fn record_mut(&mut self, item_id: &str) -> &mut EngagementRecord {
        self.records
            .entry(item_id.to_string())
            .or_insert_with(|| EngagementRecord {
                item_id: item_id.to_string(),
                ..EngagementRecord::default()
            })
    }

    /// Applies the vote toggle locally. Returns the mutation to submit, or `None` when a
    /// vote for this item is already in flight and the new intent is held behind it.
    pub fn toggle_vote<E: Engageable>(
        &mut self,
        item: &E,
        direction: Vote,
    ) -> Option<MutationTicket> {
        let mutation_id = self.peek_id();
        let current = self.view(item).tally;
        let next = apply_vote(current, direction);
        let record = self.record_mut(item.key());
        let facet = record.vote.get_or_insert_with(|| Facet::new(current));
        if !facet.is_pending() {
            *facet = Facet::new(current);
        }
        let send = facet.begin(mutation_id, next);
        debug!(item = item.key(), vote = next.vote.as_str(), held = !send, "optimistic vote");
        if !send {
            return None;
        }
        self.take_id();
        Some(MutationTicket {
            item_id: item.key().to_string(),
            mutation_id,
            request: MutationRequest::SetVote(next.vote),
        })
    }

    /// Flips the bookmark locally. Returns `None` when the flip is held behind a request
    /// already in flight.
    pub fn toggle_bookmark<E: Engageable>(&mut self, item: &E) -> Option<MutationTicket> {
        let mutation_id = self.peek_id();
        let current = self.view(item).bookmarked;
        let record = self.record_mut(item.key());
        let facet = record.bookmark.get_or_insert_with(|| Facet::new(current));
        if !facet.is_pending() {
            *facet = Facet::new(current);
        }
        let send = facet.begin(mutation_id, !current);
        debug!(item = item.key(), bookmarked = !current, held = !send, "optimistic bookmark");
        if !send {
            return None;
        }
        self.take_id();
        Some(MutationTicket {
            item_id: item.key().to_string(),
            mutation_id,
            request: MutationRequest::ToggleBookmark,
        })
    }

    /// Reconciles a finished mutation. Settled facets are dropped from the store; the
    /// caller writes settled and confirmed values into its item list and submits any
    /// follow-up request.
    pub fn resolve(
        &mut self,
        ticket: &MutationTicket,
        result: Result<(), MutationError>,
    ) -> Resolution {
        let follow_up_id = self.peek_id();
        let Some(record) = self.records.get_mut(&ticket.item_id) else {
            return Resolution::Stale;
        };
        let follow_up = |request: MutationRequest| MutationTicket {
            item_id: ticket.item_id.clone(),
            mutation_id: follow_up_id,
            request,
        };
        let resolution = match ticket.request {
            MutationRequest::SetVote(_) => match record.vote.as_mut() {
                Some(facet) => match facet.resolve(ticket.mutation_id, &result, follow_up_id) {
                    FacetOutcome::Settled(tally) => {
                        record.vote = None;
                        Resolution::Settled(Settlement::Vote(tally))
                    }
                    FacetOutcome::RolledBack(tally) => {
                        Resolution::RolledBack(Settlement::Vote(tally), error_of(result))
                    }
                    FacetOutcome::Continued { confirmed, target } => Resolution::Continued {
                        confirmed: confirmed.map(Settlement::Vote),
                        next: follow_up(MutationRequest::SetVote(target.vote)),
                    },
                    FacetOutcome::Stale => Resolution::Stale,
                },
                None => Resolution::Stale,
            },
            MutationRequest::ToggleBookmark => match record.bookmark.as_mut() {
                Some(facet) => match facet.resolve(ticket.mutation_id, &result, follow_up_id) {
                    FacetOutcome::Settled(bookmarked) => {
                        record.bookmark = None;
                        Resolution::Settled(Settlement::Bookmark(bookmarked))
                    }
                    FacetOutcome::RolledBack(bookmarked) => Resolution::RolledBack(
                        Settlement::Bookmark(bookmarked),
                        error_of(result),
                    ),
                    FacetOutcome::Continued { confirmed, .. } => Resolution::Continued {
                        confirmed: confirmed.map(Settlement::Bookmark),
                        next: follow_up(MutationRequest::ToggleBookmark),
                    },
                    FacetOutcome::Stale => Resolution::Stale,
                },
                None => Resolution::Stale,
            },
        };
        if record.is_empty() {
            self.records.remove(&ticket.item_id);
        }
        match &resolution {
            Resolution::Continued { next, .. } => {
                self.take_id();
                debug!(item = %ticket.item_id, mutation_id = next.mutation_id, "held intent sent");
            }
            Resolution::RolledBack(_, err) => {
                warn!(item = %ticket.item_id, mutation_id = ticket.mutation_id, error = %err, "mutation rolled back");
            }
            _ => {}
        }
        resolution
    }

    /// Overlays pending optimistic state on top of the item's server values.
    pub fn view<E: Engageable>(&self, item: &E) -> EngagementView {
        let mut view = EngagementView {
            tally: item.tally(),
            bookmarked: item.bookmarked(),
            vote_pending: false,
            bookmark_pending: false,
            failed: false,
        };
        let Some(record) = self.records.get(item.key()) else {
            return view;
        };
        if let Some(facet) = &record.vote {
            match facet.state {
                PendingState::Pending { .. } => {
                    view.tally = facet.value;
                    view.vote_pending = true;
                }
                PendingState::Failed { .. } => view.failed = true,
                PendingState::Idle => {}
            }
        }
        if let Some(facet) = &record.bookmark {
            match facet.state {
                PendingState::Pending { .. } => {
                    view.bookmarked = facet.value;
                    view.bookmark_pending = true;
                }
                PendingState::Failed { .. } => view.failed = true,
                PendingState::Idle => {}
            }
        }
        view
    }

    /// Forgets failure markers once the host has shown them.
    pub fn clear_failed(&mut self, item_id: &str) {
        let Some(record) = self.records.get_mut(item_id) else {
            return;
        };
        if matches!(
            record.vote.as_ref().map(|f| &f.state),
            Some(PendingState::Failed { .. })
        ) {
            record.vote = None;
        }
        if matches!(
            record.bookmark.as_ref().map(|f| &f.state),
            Some(PendingState::Failed { .. })
        ) {
            record.bookmark = None;
        }
        if record.is_empty() {
            self.records.remove(item_id);
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

fn error_of(result: Result<(), MutationError>) -> MutationError {
    result
        .err()
        .unwrap_or_else(|| MutationError::Rejected("unknown failure".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Keyed;

    #[derive(Debug, Clone)]
    struct Item {
        id: String,
        tally: VoteTally,
        bookmarked: bool,
    }

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.id
        }
    }

    impl Engageable for Item {
        fn tally(&self) -> VoteTally {
            self.tally
        }
        fn set_tally(&mut self, tally: VoteTally) {
            self.tally = tally;
        }
        fn bookmarked(&self) -> bool {
            self.bookmarked
        }
        fn set_bookmarked(&mut self, bookmarked: bool) {
            self.bookmarked = bookmarked;
        }
    }

    fn item(up: i64, down: i64, vote: Vote) -> Item {
        Item {
            id: "p1".into(),
            tally: VoteTally { vote, up, down },
            bookmarked: false,
        }
    }

    fn failure() -> Result<(), MutationError> {
        Err(MutationError::Network("offline".into()))
    }

    #[test]
    fn vote_transitions_mirror_counts() {
        let t = VoteTally {
            vote: Vote::None,
            up: 5,
            down: 2,
        };
        let up = apply_vote(t, Vote::Up);
        assert_eq!((up.vote, up.up, up.down), (Vote::Up, 6, 2));
        let none = apply_vote(up, Vote::Up);
        assert_eq!(none, t);
        let down = apply_vote(up, Vote::Down);
        assert_eq!((down.vote, down.up, down.down), (Vote::Down, 5, 3));
        let back = apply_vote(down, Vote::Up);
        assert_eq!((back.vote, back.up, back.down), (Vote::Up, 6, 2));
        let cleared = apply_vote(down, Vote::None);
        assert_eq!(cleared, t);
    }

    #[test]
    fn up_twice_nets_zero() {
        let post = item(10, 1, Vote::None);
        let mut store = EngagementStore::new();
        let first = store.toggle_vote(&post, Vote::Up).expect("first vote is sent");
        assert_eq!(store.view(&post).tally.up, 11);
        assert!(store.toggle_vote(&post, Vote::Up).is_none());
        let view = store.view(&post);
        assert_eq!(view.tally, post.tally);
        assert!(view.vote_pending);
        // The server ends up holding the upvote, so the reversal has to follow.
        let Resolution::Continued { confirmed, next } = store.resolve(&first, Ok(())) else {
            panic!("held reversal should be sent");
        };
        assert_eq!(
            confirmed,
            Some(Settlement::Vote(apply_vote(post.tally, Vote::Up)))
        );
        assert_eq!(next.request, MutationRequest::SetVote(Vote::None));
        assert_ne!(next.mutation_id, first.mutation_id);
        assert_eq!(
            store.resolve(&next, Ok(())),
            Resolution::Settled(Settlement::Vote(post.tally))
        );
        assert!(store.record("p1").is_none());
    }

    #[test]
    fn up_then_down_switches_directly() {
        let post = item(3, 3, Vote::None);
        let mut store = EngagementStore::new();
        store.toggle_vote(&post, Vote::Up);
        store.toggle_vote(&post, Vote::Down);
        let view = store.view(&post);
        assert_eq!(view.tally.vote, Vote::Down);
        assert_eq!((view.tally.up, view.tally.down), (3, 4));
    }

    #[test]
    fn failure_restores_exact_snapshot() {
        let post = item(7, 0, Vote::Down);
        let mut store = EngagementStore::new();
        let ticket = store.toggle_vote(&post, Vote::Up).expect("sent");
        assert!(store.is_pending("p1"));
        let resolution = store.resolve(&ticket, failure());
        assert!(matches!(
            resolution,
            Resolution::RolledBack(Settlement::Vote(t), _) if t == post.tally
        ));
        let view = store.view(&post);
        assert_eq!(view.tally, post.tally);
        assert!(view.failed);
        assert!(!store.is_pending("p1"));

        // A second failed attempt still lands on the same snapshot.
        let ticket = store.toggle_vote(&post, Vote::Up).expect("sent again");
        store.resolve(&ticket, failure());
        assert_eq!(store.view(&post).tally, post.tally);
    }

    #[test]
    fn failed_request_with_held_intent_sends_the_intent() {
        let post = item(1, 1, Vote::None);
        let mut store = EngagementStore::new();
        let first = store.toggle_vote(&post, Vote::Up).expect("sent");
        assert!(store.toggle_vote(&post, Vote::Down).is_none());
        let Resolution::Continued { confirmed, next } = store.resolve(&first, failure()) else {
            panic!("held downvote should be sent");
        };
        assert_eq!(confirmed, None);
        assert_eq!(next.request, MutationRequest::SetVote(Vote::Down));
        assert!(store.is_pending("p1"));
        assert!(matches!(
            store.resolve(&next, failure()),
            Resolution::RolledBack(Settlement::Vote(t), _) if t == post.tally
        ));
    }

    #[test]
    fn confirmed_value_becomes_rollback_baseline() {
        let post = item(1, 1, Vote::None);
        let mut store = EngagementStore::new();
        let first = store.toggle_vote(&post, Vote::Up).expect("sent");
        store.toggle_vote(&post, Vote::Down);
        let Resolution::Continued { next, .. } = store.resolve(&first, Ok(())) else {
            panic!("held downvote should be sent");
        };
        let resolution = store.resolve(&next, failure());
        let Resolution::RolledBack(Settlement::Vote(restored), _) = resolution else {
            panic!("expected rollback, got {resolution:?}");
        };
        assert_eq!(restored.vote, Vote::Up);
        assert_eq!((restored.up, restored.down), (2, 1));
    }

    #[test]
    fn held_intent_matching_the_server_is_dropped() {
        let post = item(0, 0, Vote::None);
        let mut store = EngagementStore::new();
        let first = store.toggle_bookmark(&post).expect("sent");
        assert!(store.toggle_bookmark(&post).is_none());
        assert!(!store.view(&post).bookmarked);
        // The save failed and the user already asked to unsave: nothing left to send.
        assert_eq!(
            store.resolve(&first, failure()),
            Resolution::Settled(Settlement::Bookmark(false))
        );
        assert!(store.record("p1").is_none());
    }

    #[test]
    fn resolving_an_unknown_ticket_is_stale() {
        let post = item(0, 0, Vote::None);
        let mut store = EngagementStore::new();
        let ticket = store.toggle_bookmark(&post).expect("sent");
        let foreign = MutationTicket {
            mutation_id: ticket.mutation_id + 100,
            ..ticket.clone()
        };
        assert_eq!(store.resolve(&foreign, Ok(())), Resolution::Stale);
        assert!(store.is_pending("p1"));
    }

    #[test]
    fn bookmark_failure_restores_boolean() {
        let mut post = item(0, 0, Vote::None);
        post.bookmarked = true;
        let mut store = EngagementStore::new();
        let ticket = store.toggle_bookmark(&post).expect("sent");
        assert!(!store.view(&post).bookmarked);
        assert_eq!(
            store.resolve(&ticket, failure()),
            Resolution::RolledBack(
                Settlement::Bookmark(true),
                MutationError::Network("offline".into())
            )
        );
        assert!(store.view(&post).bookmarked);
    }

    #[test]
    fn bookmark_and_vote_are_independent() {
        let post = item(0, 0, Vote::None);
        let mut store = EngagementStore::new();
        let vote = store.toggle_vote(&post, Vote::Up).expect("vote sent");
        let bookmark = store.toggle_bookmark(&post).expect("bookmark sent");
        assert_eq!(
            store.resolve(&bookmark, Ok(())),
            Resolution::Settled(Settlement::Bookmark(true))
        );
        assert!(store.is_pending("p1"));
        assert_eq!(
            store.record("p1").and_then(|r| r.pending_mutation_id()),
            Some(vote.mutation_id)
        );
        store.resolve(&vote, Ok(()));
        assert!(store.record("p1").is_none());
    }

    #[test]
    fn clear_failed_drops_marker() {
        let post = item(0, 0, Vote::None);
        let mut store = EngagementStore::new();
        let ticket = store.toggle_bookmark(&post).expect("sent");
        store.resolve(&ticket, failure());
        assert!(store.view(&post).failed);
        store.clear_failed("p1");
        assert!(store.record("p1").is_none());
    }
}
