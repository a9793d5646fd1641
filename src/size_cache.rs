use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::MeasurementError;

/// Layout heuristics used before a row has been measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimator {
    pub base_row_height: f64,
    pub media_extra_height: f64,
    pub reply_row_height: f64,
}

impl Default for Estimator {
    fn default() -> Self {
        Self {
            base_row_height: 140.0,
            media_extra_height: 320.0,
            reply_row_height: 120.0,
        }
    }
}

impl Estimator {
    pub fn estimate(&self, shape: RowShape) -> f64 {
        let mut height = self.base_row_height;
        if shape.has_media {
            height += self.media_extra_height;
        }
        height + self.reply_row_height * shape.expanded_replies as f64
    }
}

/// Content facts the estimate depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowShape {
    pub has_media: bool,
    pub expanded_replies: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeEntry {
    pub key: String,
    pub estimated: f64,
    pub measured: Option<f64>,
    pub shape: RowShape,
}

impl SizeEntry {
    pub fn size(&self) -> f64 {
        self.measured.unwrap_or(self.estimated)
    }

    pub fn is_measured(&self) -> bool {
        self.measured.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SizeCache {
    estimator: Estimator,
    entries: HashMap<String, SizeEntry>,
}

impl SizeCache {
    pub fn new(estimator: Estimator) -> Self {
        Self {
            estimator,
            entries: HashMap::new(),
        }
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    pub fn get(&self, key: &str) -> Option<&SizeEntry> {
        self.entries.get(key)
    }

    pub fn size_of(&self, key: &str) -> Option<f64> {
        self.entries.get(key).map(SizeEntry::size)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers `key` with an estimate unless it is already known. Returns the
    /// current size of the row.
    pub fn ensure(&mut self, key: &str, shape: RowShape) -> f64 {
        let estimator = self.estimator;
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| SizeEntry {
                key: key.to_string(),
                estimated: estimator.estimate(shape),
                measured: None,
                shape,
            })
            .size()
    }

    /// Stores a measured height. Invalid heights leave the previous value in place.
    /// Returns `(old, new)` sizes.
    pub fn measure(&mut self, key: &str, height: f64) -> Result<(f64, f64), MeasurementError> {
        if !height.is_finite() || height <= 0.0 {
            return Err(MeasurementError::InvalidHeight {
                key: key.to_string(),
                height,
            });
        }
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| MeasurementError::UnknownKey(key.to_string()))?;
        let old = entry.size();
        entry.measured = Some(height);
        Ok((old, height))
    }

    /// Drops the measurement and re-estimates with `shape`. Returns `(old, new)` sizes,
    /// or `None` when the key is unknown.
    pub fn invalidate(&mut self, key: &str, shape: RowShape) -> Option<(f64, f64)> {
        let estimator = self.estimator;
        let entry = self.entries.get_mut(key)?;
        let old = entry.size();
        entry.shape = shape;
        entry.estimated = estimator.estimate(shape);
        entry.measured = None;
        Some((old, entry.estimated))
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_adds_media_and_expanded_replies() {
        let estimator = Estimator::default();
        assert_eq!(estimator.estimate(RowShape::default()), 140.0);
        assert_eq!(
            estimator.estimate(RowShape {
                has_media: true,
                expanded_replies: 0
            }),
            460.0
        );
        assert_eq!(
            estimator.estimate(RowShape {
                has_media: false,
                expanded_replies: 2
            }),
            380.0
        );
    }

    #[test]
    fn measurement_overrides_estimate() {
        let mut cache = SizeCache::new(Estimator::default());
        assert_eq!(cache.ensure("a", RowShape::default()), 140.0);
        assert_eq!(cache.measure("a", 95.5).unwrap(), (140.0, 95.5));
        assert_eq!(cache.size_of("a"), Some(95.5));
        assert!(cache.get("a").unwrap().is_measured());
        // A second ensure keeps the measurement.
        assert_eq!(cache.ensure("a", RowShape::default()), 95.5);
    }

    #[test]
    fn invalid_heights_keep_last_valid_value() {
        let mut cache = SizeCache::new(Estimator::default());
        cache.ensure("a", RowShape::default());
        cache.measure("a", 200.0).unwrap();
        for bad in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                cache.measure("a", bad),
                Err(MeasurementError::InvalidHeight { .. })
            ));
            assert_eq!(cache.size_of("a"), Some(200.0));
        }
        assert_eq!(
            cache.measure("missing", 10.0),
            Err(MeasurementError::UnknownKey("missing".into()))
        );
    }

    #[test]
    fn invalidate_reverts_to_new_estimate() {
        let mut cache = SizeCache::new(Estimator::default());
        cache.ensure("c1", RowShape::default());
        cache.measure("c1", 150.0).unwrap();
        let expanded = RowShape {
            has_media: false,
            expanded_replies: 2,
        };
        assert_eq!(cache.invalidate("c1", expanded), Some((150.0, 380.0)));
        assert!(!cache.get("c1").unwrap().is_measured());
        assert_eq!(cache.invalidate("nope", expanded), None);
    }
}
