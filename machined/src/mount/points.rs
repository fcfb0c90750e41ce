//! Insertion-ordered collection of mount points.

use super::point::Point;
use machined_shared::{MachinedError, MachinedResult};
use std::collections::HashMap;

/// Mount points keyed by name, iterated in insertion order.
///
/// Re-inserting an existing key moves it to the end.
#[derive(Debug, Clone, Default)]
pub struct Points {
    points: HashMap<String, Point>,
    order: Vec<String>,
}

impl Points {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`.
    ///
    /// Fails if another key already mounts at the same target.
    pub fn set(&mut self, key: impl Into<String>, point: Point) -> MachinedResult<()> {
        let key = key.into();
        let target = point.target();

        if let Some((other, _)) = self
            .points
            .iter()
            .find(|(k, p)| **k != key && p.target() == target)
        {
            return Err(MachinedError::InvalidArgument(format!(
                "target {} of {} is already used by {}",
                target, key, other
            )));
        }

        self.order.retain(|k| *k != key);
        self.order.push(key.clone());
        self.points.insert(key, point);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Point> {
        self.points.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Point> {
        self.order.retain(|k| k != key);
        self.points.remove(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Points in insertion order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&str, &Point)> {
        self.order
            .iter()
            .filter_map(|k| self.points.get(k).map(|p| (k.as_str(), p)))
    }

    /// Points in reverse insertion order.
    pub fn iter_rev(&self) -> impl Iterator<Item = (&str, &Point)> {
        self.iter().rev()
    }

    /// Rewrite every target in place to live under `prefix`.
    pub fn prefix_targets(&mut self, prefix: &str) {
        for point in self.points.values_mut() {
            point.prefix_target(prefix);
        }
    }

    /// Merge `other` into this set, appending its keys in order.
    pub fn extend(&mut self, other: Points) -> MachinedResult<()> {
        let Points { mut points, order } = other;
        for key in order {
            if let Some(point) = points.remove(&key) {
                self.set(key, point)?;
            }
        }
        Ok(())
    }
}
