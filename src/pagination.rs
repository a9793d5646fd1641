use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::FetchError;
use crate::model::Keyed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub is_fetching: bool,
}

impl PageCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: 0,
            page_size: page_size.max(1),
            has_more: true,
            is_fetching: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.page * self.page_size
    }
}

/// What the backend is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Proof that a fetch was started. Tickets from before a [`PaginationController::reset`]
/// no longer apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub generation: u64,
    pub request: PageRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendReport {
    pub appended: usize,
    pub refreshed: usize,
    pub kept_local: usize,
}

impl AppendReport {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.refreshed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("fetch ticket from generation {ticket} does not match current generation {current}")]
pub struct StaleTicket {
    pub ticket: u64,
    pub current: u64,
}

#[derive(Debug, Clone)]
pub struct PaginationController<T> {
    cursor: PageCursor,
    items: Vec<T>,
    positions: HashMap<String, usize>,
    generation: u64,
    last_error: Option<FetchError>,
}

impl<T: Keyed + Clone> PaginationController<T> {
    pub fn new(page_size: usize) -> Self {
        Self {
            cursor: PageCursor::new(page_size),
            items: Vec::new(),
            positions: HashMap::new(),
            generation: 0,
            last_error: None,
        }
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn has_more(&self) -> bool {
        self.cursor.has_more
    }

    pub fn is_fetching(&self) -> bool {
        self.cursor.is_fetching
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.positions.get(id).map(|&index| &self.items[index])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let index = *self.positions.get(id)?;
        Some(&mut self.items[index])
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn should_fetch_next(
        &self,
        last_rendered_index: usize,
        item_count: usize,
        threshold: usize,
    ) -> bool {
        item_count.saturating_sub(last_rendered_index) <= threshold
            && self.cursor.has_more
            && !self.cursor.is_fetching
    }

    /// Marks the cursor as fetching. Returns `None` when a fetch is already in flight
    /// or the list is exhausted; callers must not issue a request in that case.
    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if self.cursor.is_fetching || !self.cursor.has_more {
            return None;
        }
        self.cursor.is_fetching = true;
        Some(FetchTicket {
            generation: self.generation,
            request: PageRequest {
                page: self.cursor.page,
                page_size: self.cursor.page_size,
                offset: self.cursor.offset(),
            },
        })
    }

    /// Applies a fetched page. Items already present are refreshed in place unless
    /// `is_pinned` reports local state that must not be overwritten.
    pub fn complete_fetch<F>(
        &mut self,
        ticket: FetchTicket,
        new_items: Vec<T>,
        has_more: bool,
        is_pinned: F,
    ) -> Result<AppendReport, StaleTicket>
    where
        F: Fn(&str) -> bool,
    {
        self.check_ticket(ticket)?;
        let report = self.merge(new_items, is_pinned);
        self.cursor.is_fetching = false;
        self.cursor.has_more = has_more;
        self.cursor.page = ticket.request.page + 1;
        self.last_error = None;
        info!(
            page = ticket.request.page,
            appended = report.appended,
            refreshed = report.refreshed,
            kept_local = report.kept_local,
            has_more,
            "page applied"
        );
        Ok(report)
    }

    /// Clears the in-flight flag after a failed fetch. Loaded items stay.
    pub fn fail_fetch(&mut self, ticket: FetchTicket, err: FetchError) -> Result<(), StaleTicket> {
        self.check_ticket(ticket)?;
        self.cursor.is_fetching = false;
        self.last_error = Some(err);
        Ok(())
    }

    fn check_ticket(&self, ticket: FetchTicket) -> Result<(), StaleTicket> {
        if ticket.generation != self.generation || !self.cursor.is_fetching {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                "discarding stale page"
            );
            return Err(StaleTicket {
                ticket: ticket.generation,
                current: self.generation,
            });
        }
        Ok(())
    }

    fn merge<F>(&mut self, new_items: Vec<T>, is_pinned: F) -> AppendReport
    where
        F: Fn(&str) -> bool,
    {
        let mut report = AppendReport::default();
        for item in new_items {
            match self.positions.get(item.key()).copied() {
                Some(_) if is_pinned(item.key()) => report.kept_local += 1,
                Some(index) => {
                    self.items[index] = item;
                    report.refreshed += 1;
                }
                None => {
                    self.positions
                        .insert(item.key().to_string(), self.items.len());
                    self.items.push(item);
                    report.appended += 1;
                }
            }
        }
        report
    }

    /// Inserts a locally created item at the end (or refreshes it in place).
    pub fn upsert(&mut self, item: T) {
        match self.positions.get(item.key()).copied() {
            Some(index) => self.items[index] = item,
            None => {
                self.positions
                    .insert(item.key().to_string(), self.items.len());
                self.items.push(item);
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let index = self.positions.remove(id)?;
        let removed = self.items.remove(index);
        for (offset, item) in self.items[index..].iter().enumerate() {
            self.positions.insert(item.key().to_string(), index + offset);
        }
        Some(removed)
    }

    /// Starts over for a new query context. Any in-flight fetch becomes stale.
    pub fn reset(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.cursor = PageCursor::new(self.cursor.page_size);
        self.items.clear();
        self.positions.clear();
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: &'static str,
        rev: u32,
    }

    impl Keyed for Item {
        fn key(&self) -> &str {
            self.id
        }
    }

    fn item(id: &'static str, rev: u32) -> Item {
        Item { id, rev }
    }

    fn ids(p: &PaginationController<Item>) -> Vec<&str> {
        p.items().iter().map(|i| i.id).collect()
    }

    #[test]
    fn should_fetch_only_near_the_end() {
        let p = PaginationController::<Item>::new(2);
        assert!(!p.should_fetch_next(2, 10, 3));
        assert!(p.should_fetch_next(7, 10, 3));
        assert!(p.should_fetch_next(9, 10, 3));
        assert!(p.should_fetch_next(12, 10, 3));
    }

    #[test]
    fn exhausted_cursor_never_fetches() {
        let mut p = PaginationController::new(2);
        let ticket = p.begin_fetch().unwrap();
        p.complete_fetch(ticket, vec![item("a", 0)], false, |_| false)
            .unwrap();
        assert!(!p.should_fetch_next(0, 1, 5));
        assert!(p.begin_fetch().is_none());
    }

    #[test]
    fn second_begin_is_a_noop_while_fetching() {
        let mut p = PaginationController::<Item>::new(2);
        let ticket = p.begin_fetch().unwrap();
        assert!(p.begin_fetch().is_none());
        for _ in 0..3 {
            assert!(!p.should_fetch_next(0, 0, 5));
        }
        p.complete_fetch(ticket, vec![item("a", 0)], true, |_| false)
            .unwrap();
        assert!(p.should_fetch_next(0, 1, 5));
        assert_eq!(p.cursor().page, 1);
    }

    #[test]
    fn dedups_and_refreshes_unpinned_items() {
        let mut p = PaginationController::new(3);
        let t = p.begin_fetch().unwrap();
        p.complete_fetch(t, vec![item("a", 0), item("b", 0)], true, |_| false)
            .unwrap();
        let t = p.begin_fetch().unwrap();
        let report = p
            .complete_fetch(
                t,
                vec![item("b", 1), item("a", 1), item("c", 0), item("c", 9)],
                false,
                |id| id == "a",
            )
            .unwrap();
        assert_eq!(ids(&p), ["a", "b", "c"]);
        assert_eq!(p.get("a").unwrap().rev, 0);
        assert_eq!(p.get("b").unwrap().rev, 1);
        assert_eq!(p.get("c").unwrap().rev, 9);
        assert_eq!(report.appended, 1);
        assert_eq!(report.kept_local, 1);
        assert_eq!(report.refreshed, 2);
        assert!(!p.has_more());
        assert!(p.begin_fetch().is_none());
    }

    #[test]
    fn failure_keeps_items_and_allows_retry() {
        let mut p = PaginationController::new(2);
        let t = p.begin_fetch().unwrap();
        p.complete_fetch(t, vec![item("a", 0)], true, |_| false)
            .unwrap();
        let t = p.begin_fetch().unwrap();
        p.fail_fetch(t, FetchError::Network("offline".into()))
            .unwrap();
        assert_eq!(ids(&p), ["a"]);
        assert!(!p.is_fetching());
        assert!(p.last_error().is_some());
        let retry = p.begin_fetch().unwrap();
        assert_eq!(retry.request.page, 1);
        assert_eq!(retry.request.offset, 2);
    }

    #[test]
    fn reset_makes_inflight_ticket_stale() {
        let mut p = PaginationController::new(2);
        let t = p.begin_fetch().unwrap();
        p.reset();
        assert!(p
            .complete_fetch(t, vec![item("a", 0)], true, |_| false)
            .is_err());
        assert!(p.is_empty());
        assert!(!p.is_fetching());
        let fresh = p.begin_fetch().unwrap();
        assert_eq!(fresh.request.page, 0);
        assert_eq!(fresh.generation, 1);
    }

    #[test]
    fn remove_reindexes_tail() {
        let mut p = PaginationController::new(5);
        p.upsert(item("a", 0));
        p.upsert(item("b", 0));
        p.upsert(item("c", 0));
        assert_eq!(p.remove("a").map(|i| i.id), Some("a"));
        assert_eq!(p.position("c"), Some(1));
        assert!(p.get("a").is_none());
    }
}
