//! Removal of aliased buffer entries
//!
//! A state map may hold several names for overlapping bytes of one storage
//! block (tied embeddings, adapter views of a base weight). Loading into such
//! a map would write the same bytes twice, so entries whose occupied range is
//! covered by another kept entry on the same device and block are dropped.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use shardload_core::{Device, TensorMap};

/// Finds and removes entries that alias a larger kept entry
#[derive(Debug, Default, Clone, Copy)]
pub struct SubtensorDeduplicator;

impl SubtensorDeduplicator {
    pub fn new() -> Self {
        Self
    }

    /// Names that would be dropped from `tensors`
    ///
    /// Within a group the survivor is the entry with the widest range, then
    /// the contiguous one, then the lexicographically smaller name, so the
    /// result depends only on the input.
    pub fn duplicates(&self, tensors: &TensorMap) -> BTreeSet<String> {
        let mut groups: HashMap<(Device, usize), Vec<(&str, Range<usize>, bool)>> = HashMap::new();
        for (name, buffer) in tensors {
            if let Some(id) = buffer.storage_id() {
                groups
                    .entry((buffer.device(), id))
                    .or_default()
                    .push((name.as_str(), buffer.byte_range(), buffer.is_contiguous()));
            }
        }

        let mut dropped = BTreeSet::new();
        for (_, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| {
                let a_len = a.1.end - a.1.start;
                let b_len = b.1.end - b.1.start;
                b_len
                    .cmp(&a_len)
                    .then_with(|| b.2.cmp(&a.2))
                    .then_with(|| a.0.cmp(b.0))
            });

            let mut kept: Vec<Range<usize>> = Vec::new();
            for (name, range, _) in members {
                let covered = kept
                    .iter()
                    .any(|k| k.start <= range.start && range.end <= k.end);
                if covered {
                    dropped.insert(name.to_string());
                } else {
                    kept.push(range);
                }
            }
        }
        dropped
    }

    /// Drop aliased entries, returning the survivors
    pub fn deduplicate(&self, mut tensors: TensorMap) -> TensorMap {
        let dropped = self.duplicates(&tensors);
        if !dropped.is_empty() {
            tracing::debug!(dropped = dropped.len(), names = ?dropped, "Removed aliased entries");
        }
        for name in &dropped {
            tensors.remove(name);
        }
        tensors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardload_core::{DType, TensorBuffer};

    #[test]
    fn test_identical_views_keep_smaller_name() {
        let base = TensorBuffer::from_f32(vec![4], &[1.0; 4]).unwrap();
        let mut map = TensorMap::new();
        map.insert("lm_head.weight".to_string(), base.clone());
        map.insert("embed.weight".to_string(), base);

        let out = SubtensorDeduplicator::new().deduplicate(map);
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["embed.weight"]);
    }

    #[test]
    fn test_contained_view_dropped() {
        let base = TensorBuffer::zeros(vec![4, 4], DType::F32);
        let row = base.alias(16, vec![4], true).unwrap();
        let mut map = TensorMap::new();
        map.insert("a_row".to_string(), row);
        map.insert("z_full".to_string(), base);

        let dropped = SubtensorDeduplicator::new().duplicates(&map);
        assert_eq!(dropped.into_iter().collect::<Vec<_>>(), vec!["a_row"]);
    }

    #[test]
    fn test_contiguous_preferred_on_equal_range() {
        let base = TensorBuffer::zeros(vec![2, 3], DType::F32);
        let transposed = base.alias(0, vec![3, 2], false).unwrap();
        let mut map = TensorMap::new();
        map.insert("a_t".to_string(), transposed);
        map.insert("b".to_string(), base);

        let out = SubtensorDeduplicator::new().deduplicate(map);
        assert!(out.contains_key("b"));
        assert!(!out.contains_key("a_t"));
    }

    #[test]
    fn test_disjoint_and_cross_device_kept() {
        let base = TensorBuffer::zeros(vec![8], DType::F32);
        let lo = base.alias(0, vec![4], true).unwrap();
        let hi = base.alias(16, vec![4], true).unwrap();
        let other_device = lo.clone().with_device(Device::Cuda(0));

        let mut map = TensorMap::new();
        map.insert("lo".to_string(), lo);
        map.insert("hi".to_string(), hi);
        map.insert("lo_gpu".to_string(), other_device);

        assert!(SubtensorDeduplicator::new().duplicates(&map).is_empty());
    }

    #[test]
    fn test_zero_length_passes_through() {
        let mut map = TensorMap::new();
        map.insert("a".to_string(), TensorBuffer::zeros(vec![0], DType::F32));
        map.insert("b".to_string(), TensorBuffer::zeros(vec![0], DType::F32));
        assert_eq!(SubtensorDeduplicator::new().deduplicate(map).len(), 2);
    }

    #[test]
    fn test_no_survivor_contained_in_another() {
        let base = TensorBuffer::zeros(vec![16], DType::U8);
        let mut map = TensorMap::new();
        for (i, (start, len)) in [(0, 16), (0, 8), (4, 4), (8, 8), (2, 12), (12, 4)].iter().enumerate() {
            map.insert(format!("v{}", i), base.alias(*start, vec![*len], true).unwrap());
        }

        let out = SubtensorDeduplicator::new().deduplicate(map.clone());
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("v0"));

        // Same input, same survivors
        let again = SubtensorDeduplicator::new().deduplicate(map);
        assert_eq!(again.keys().collect::<Vec<_>>(), out.keys().collect::<Vec<_>>());
    }
}
