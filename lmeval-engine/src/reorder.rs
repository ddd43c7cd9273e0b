//! Sort requests for batching and restore the caller's order afterwards.
//!
//! Requests are processed in key order (longest first for scoring) and the
//! results are scattered back into an array of the original size.

use crate::error::{EvalError, Result};

/// Remembers the original position of every item while handing them out in
/// key order.
#[derive(Debug)]
pub struct Reorderer<T> {
    size: usize,
    /// `(original indices, representative item)` in key order
    groups: Vec<(Vec<usize>, T)>,
}

impl<T> Reorderer<T> {
    /// Stable-sort `items` by `key`. Equal keys keep their input order.
    pub fn new<K, F>(items: Vec<T>, key: F) -> Self
    where
        K: Ord,
        F: FnMut(&T) -> K,
    {
        let size = items.len();
        let groups = sorted_by_key(items, key)
            .into_iter()
            .map(|(_, index, item)| (vec![index], item))
            .collect();
        Self { size, groups }
    }

    /// Like [`Reorderer::new`], but items with equal keys collapse into one
    /// group. Only the first item of a group is handed out; its result is
    /// copied to every member by [`Reorderer::get_original`].
    pub fn grouped<K, F>(items: Vec<T>, key: F) -> Self
    where
        K: Ord,
        F: FnMut(&T) -> K,
    {
        let size = items.len();
        let mut groups: Vec<(Vec<usize>, T)> = Vec::with_capacity(size);
        let mut last_key: Option<K> = None;

        for (k, index, item) in sorted_by_key(items, key) {
            let same_group = last_key.as_ref().is_some_and(|prev| *prev == k);
            match groups.last_mut() {
                Some((indices, _)) if same_group => indices.push(index),
                _ => {
                    groups.push((vec![index], item));
                    last_key = Some(k);
                }
            }
        }

        Self { size, groups }
    }

    /// Items in key order (one per group).
    pub fn get_reordered(&self) -> impl ExactSizeIterator<Item = &T> {
        self.groups.iter().map(|(_, item)| item)
    }

    /// How many original items each handed-out item stands for, in key order.
    pub fn group_sizes(&self) -> impl ExactSizeIterator<Item = usize> + '_ {
        self.groups.iter().map(|(indices, _)| indices.len())
    }

    /// Number of items handed out by [`Reorderer::get_reordered`].
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of items originally passed in.
    pub fn original_len(&self) -> usize {
        self.size
    }

    /// Scatter results given in key order back to the original positions.
    pub fn get_original<R: Clone>(&self, results: Vec<R>) -> Result<Vec<R>> {
        if results.len() != self.groups.len() {
            return Err(EvalError::ResultCount {
                expected: self.groups.len(),
                actual: results.len(),
            });
        }

        let mut out: Vec<Option<R>> = vec![None; self.size];
        for ((indices, _), result) in self.groups.iter().zip(results) {
            for &index in indices {
                out[index] = Some(result.clone());
            }
        }

        out.into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or(EvalError::ResultCount {
                expected: self.size,
                actual: self.groups.iter().map(|(indices, _)| indices.len()).sum(),
            })
    }
}

fn sorted_by_key<T, K, F>(items: Vec<T>, mut key: F) -> Vec<(K, usize, T)>
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    let mut keyed: Vec<(K, usize, T)> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| (key(&item), index, item))
        .collect();
    // `sort_by` is stable, so ties keep ascending original index
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed
}
