use std::collections::HashMap;
use std::ops::Range;

use tracing::debug;

use crate::error::MeasurementError;
use crate::size_cache::{Estimator, RowShape, SizeCache, SizeEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    pub start: usize,
    pub end: usize,
    pub empty: bool,
}

impl VisibleRange {
    const EMPTY: VisibleRange = VisibleRange {
        start: 0,
        end: 0,
        empty: true,
    };

    /// Half-open index range, empty when there are no rows.
    pub fn indices(&self) -> Range<usize> {
        if self.empty {
            0..0
        } else {
            self.start..self.end + 1
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        !self.empty && index >= self.start && index <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualItem {
    pub index: usize,
    pub key: String,
    pub start: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualWindow {
    pub range: VisibleRange,
    pub items: Vec<VirtualItem>,
    pub total_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Start,
    Center,
    End,
}

/// Keeps row order plus cached prefix sums over the sizes held in a [`SizeCache`].
///
/// `starts[i]` is the offset of row `i`; `starts[len]` is the total size. A size change
/// at row `i` only rewrites `starts[i + 1..]`, so every row above it keeps its position.
#[derive(Debug, Clone)]
pub struct WindowVirtualizer {
    sizes: SizeCache,
    keys: Vec<String>,
    positions: HashMap<String, usize>,
    starts: Vec<f64>,
}

impl Default for WindowVirtualizer {
    fn default() -> Self {
        Self::new(Estimator::default())
    }
}

impl WindowVirtualizer {
    pub fn new(estimator: Estimator) -> Self {
        Self {
            sizes: SizeCache::new(estimator),
            keys: Vec::new(),
            positions: HashMap::new(),
            starts: vec![0.0],
        }
    }

    pub fn sizes(&self) -> &SizeCache {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, index: usize) -> Option<&str> {
        self.keys.get(index).map(String::as_str)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.positions.get(key).copied()
    }

    pub fn entry(&self, index: usize) -> Option<&SizeEntry> {
        self.keys.get(index).and_then(|key| self.sizes.get(key))
    }

    /// Best guess for the row at `index` before it is measured.
    pub fn estimate(&self, index: usize) -> Option<f64> {
        self.entry(index).map(|entry| entry.estimated)
    }

    pub fn size(&self, index: usize) -> f64 {
        self.entry(index).map(SizeEntry::size).unwrap_or(0.0)
    }

    pub fn start_of(&self, index: usize) -> f64 {
        self.starts
            .get(index.min(self.keys.len()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn total_size(&self) -> f64 {
        self.starts.last().copied().unwrap_or(0.0)
    }

    pub fn average_size(&self) -> f64 {
        if self.keys.is_empty() {
            0.0
        } else {
            self.total_size() / self.keys.len() as f64
        }
    }

    /// Replaces the row order. Known keys keep their measurements; unknown keys get an
    /// estimate; keys no longer present are evicted from the cache.
    pub fn set_rows<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = (String, RowShape)>,
    {
        let mut keys = Vec::new();
        for (key, shape) in rows {
            self.sizes.ensure(&key, shape);
            keys.push(key);
        }
        let first_change = self
            .keys
            .iter()
            .zip(keys.iter())
            .position(|(old, new)| old != new)
            .unwrap_or_else(|| self.keys.len().min(keys.len()));

        self.keys = keys;
        self.positions = self
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| (key.clone(), index))
            .collect();
        let positions = &self.positions;
        self.sizes.retain(|key| positions.contains_key(key));
        self.starts.truncate(first_change + 1);
        self.recompute_from(first_change);
    }

    /// Appends rows after the current tail. Offsets of existing rows are untouched.
    pub fn push_rows<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = (String, RowShape)>,
    {
        let from = self.keys.len();
        for (key, shape) in rows {
            if self.positions.contains_key(&key) {
                continue;
            }
            self.sizes.ensure(&key, shape);
            self.positions.insert(key.clone(), self.keys.len());
            self.keys.push(key);
        }
        self.recompute_from(from);
    }

    /// Records a measured height and returns how much the total size moved.
    pub fn measure(&mut self, key: &str, height: f64) -> Result<f64, MeasurementError> {
        let index = self
            .index_of(key)
            .ok_or_else(|| MeasurementError::UnknownKey(key.to_string()))?;
        let (old, new) = self.sizes.measure(key, height)?;
        if old != new {
            self.recompute_from(index);
        }
        Ok(new - old)
    }

    /// Reverts `key` to an estimate for `shape`; returns the size delta.
    pub fn invalidate(&mut self, key: &str, shape: RowShape) -> Option<f64> {
        let index = self.index_of(key)?;
        let (old, new) = self.sizes.invalidate(key, shape)?;
        debug!(key, old, new, "row size invalidated");
        self.recompute_from(index);
        Some(new - old)
    }

    fn recompute_from(&mut self, index: usize) {
        let len = self.keys.len();
        self.starts.resize(len + 1, 0.0);
        self.starts[0] = 0.0;
        for i in index.min(len)..len {
            let size = self.sizes.size_of(&self.keys[i]).unwrap_or(0.0);
            self.starts[i + 1] = self.starts[i] + size;
        }
    }

    /// Rows intersecting `[scroll_offset, scroll_offset + viewport_height)`, widened by
    /// `overscan` average rows on each side. Always within bounds.
    pub fn visible_range(
        &self,
        scroll_offset: f64,
        viewport_height: f64,
        overscan: usize,
    ) -> VisibleRange {
        let len = self.keys.len();
        if len == 0 {
            return VisibleRange::EMPTY;
        }
        let scroll = if scroll_offset.is_finite() {
            scroll_offset
        } else {
            0.0
        };
        let viewport = if viewport_height.is_finite() {
            viewport_height.max(0.0)
        } else {
            0.0
        };
        let pad = overscan as f64 * self.average_size();
        let low = (scroll - pad).max(0.0);
        let high = scroll + viewport + pad;

        let ends = &self.starts[1..=len];
        let start = ends.partition_point(|end| *end <= low).min(len - 1);
        let starts = &self.starts[..len];
        let end = starts
            .partition_point(|start| *start < high)
            .saturating_sub(1)
            .clamp(start, len - 1);

        VisibleRange {
            start,
            end,
            empty: false,
        }
    }

    pub fn window(
        &self,
        scroll_offset: f64,
        viewport_height: f64,
        overscan: usize,
    ) -> VirtualWindow {
        let range = self.visible_range(scroll_offset, viewport_height, overscan);
        let items = range
            .indices()
            .map(|index| VirtualItem {
                index,
                key: self.keys[index].clone(),
                start: self.starts[index],
                size: self.starts[index + 1] - self.starts[index],
            })
            .collect();
        VirtualWindow {
            range,
            items,
            total_size: self.total_size(),
        }
    }

    /// Scroll offset that brings `index` into view with the given alignment.
    pub fn scroll_offset_for(&self, index: usize, align: Align, viewport_height: f64) -> f64 {
        if self.keys.is_empty() {
            return 0.0;
        }
        let index = index.min(self.keys.len() - 1);
        let start = self.starts[index];
        let size = self.size(index);
        let target = match align {
            Align::Start => start,
            Align::Center => start + size / 2.0 - viewport_height / 2.0,
            Align::End => start + size - viewport_height,
        };
        self.clamp_scroll(target, viewport_height)
    }

    pub fn clamp_scroll(&self, offset: f64, viewport_height: f64) -> f64 {
        let max = (self.total_size() - viewport_height).max(0.0);
        if offset.is_finite() {
            offset.clamp(0.0, max)
        } else {
            0.0
        }
    }
}
