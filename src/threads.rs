use std::collections::HashSet;

use crate::size_cache::RowShape;
use crate::virtualizer::WindowVirtualizer;

/// Which comments currently show their replies. Keyed by comment id so the state
/// survives reorders and pagination.
#[derive(Debug, Clone, Default)]
pub struct ThreadExpander {
    expanded: HashSet<String>,
}

impl ThreadExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_expanded(&self, comment_id: &str) -> bool {
        self.expanded.contains(comment_id)
    }

    /// Flips the comment and invalidates its cached height so the next layout pass
    /// re-estimates it. Returns whether the comment is now expanded.
    pub fn toggle(
        &mut self,
        comment_id: &str,
        reply_count: usize,
        virtualizer: &mut WindowVirtualizer,
    ) -> bool {
        let expanded = if self.expanded.remove(comment_id) {
            false
        } else {
            self.expanded.insert(comment_id.to_string());
            true
        };
        virtualizer.invalidate(comment_id, shape_for(expanded, reply_count));
        expanded
    }

    /// Forgets comments that are no longer listed.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.expanded.retain(|id| keep(id));
    }
}

fn shape_for(expanded: bool, reply_count: usize) -> RowShape {
    RowShape {
        has_media: false,
        expanded_replies: if expanded { reply_count } else { 0 },
    }
}
