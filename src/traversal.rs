//! A dependency-aware worklist: items become ready once every dependency
//! they were registered with has been marked ready (§4.2 "schedule
//! search" drives its candidate order through this).
//!
//! Grounded directly on `dep_aware_converter<T>`: a ready set, a pending
//! map from item to outstanding dependency count, `insert`/`insert_ready`/
//! `mark_dep_ready`, and two `execute` styles (items processed one at a
//! time, or a whole ready frontier handed to the caller at once).
//! Generalized from the original's `T*` identity (pointer equality) to
//! any `Eq + Hash + Clone` key, since this façade's items are `Inst`/
//! `Block` handles rather than LLVM IR pointers.

use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;

/// A worklist where each item's readiness depends on a dependency count
/// rather than direct predecessor scanning.
pub struct DepAwareConverter<T: Eq + Hash + Clone> {
    ready: FxHashSet<T>,
    pending: FxHashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> Default for DepAwareConverter<T> {
    fn default() -> Self {
        Self {
            ready: FxHashSet::default(),
            pending: FxHashMap::default(),
        }
    }
}

impl<T: Eq + Hash + Clone> DepAwareConverter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_ready(&mut self, item: T) {
        self.ready.insert(item);
    }

    /// Registers `item` with `deps` outstanding dependencies. An item
    /// with zero dependencies goes straight to the ready set.
    pub fn insert(&mut self, item: T, deps: u32) {
        if deps == 0 {
            self.insert_ready(item);
        } else {
            self.pending.insert(item, deps);
        }
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.pending.clear();
    }

    pub fn erase(&mut self, item: &T) {
        self.ready.remove(item);
        self.pending.remove(item);
    }

    pub fn contains(&self, item: &T) -> bool {
        self.ready.contains(item) || self.pending.contains_key(item)
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty()
    }

    /// Removes and returns one ready item, in unspecified order. Exposed
    /// alongside `execute`/`execute_frontier` for passes (Converge's plan
    /// construction) that need to interleave worklist draining with other
    /// per-round bookkeeping a plain callback can't express cleanly.
    pub fn take_ready(&mut self) -> Option<T> {
        let item = self.ready.iter().next()?.clone();
        self.ready.remove(&item);
        Some(item)
    }

    /// Decrements `item`'s dependency count; moves it to ready once the
    /// count reaches zero. Logs (rather than the original's `errs()`
    /// print) if `item` was not pending, since that indicates a caller
    /// bug rather than a data condition worth propagating as an error.
    pub fn mark_dep_ready(&mut self, item: &T) {
        let Some(count) = self.pending.get_mut(item) else {
            log::warn!("dep-aware converter: item marked ready but not pending");
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.pending.remove(item);
            self.ready.insert(item.clone());
        }
    }

    /// Processes ready items one at a time; `cb` may call `mark_dep_ready`
    /// on other items to unblock them, and may call `insert`/`insert_ready`
    /// to add new items to the worklist.
    pub fn execute(&mut self, mut cb: impl FnMut(&mut Self, T)) {
        while let Some(item) = self.ready.iter().next().cloned() {
            self.ready.remove(&item);
            cb(self, item);
        }
        if !self.is_empty() {
            log::debug!(
                "dep-aware converter: {} item(s) never became ready",
                self.pending.len()
            );
        }
    }

    /// Hands the whole current ready frontier to `cb` at once; `cb`
    /// returns the subset it actually processed, which is then removed
    /// from the ready set (items it leaves behind stay ready for the next
    /// round). Used when a pass wants to batch-process same-iteration
    /// candidates together rather than one at a time.
    pub fn execute_frontier(&mut self, mut cb: impl FnMut(&mut Self, &FxHashSet<T>) -> FxHashSet<T>) {
        while !self.ready.is_empty() {
            let candidates = self.ready.clone();
            let processed = cb(self, &candidates);
            for item in &processed {
                self.ready.remove(item);
            }
        }
        if !self.pending.is_empty() {
            log::debug!(
                "dep-aware converter: {} item(s) never became ready",
                self.pending.len()
            );
        }
    }
}

/// Seeds a converter from every item in `items`, using `dep_count` (the
/// predecessor/successor count, depending on traversal direction) as each
/// item's dependency count (`init_forward`/`init_backward`).
pub fn init_from<T: Eq + Hash + Clone>(
    items: impl IntoIterator<Item = T>,
    mut dep_count: impl FnMut(&T) -> u32,
) -> DepAwareConverter<T> {
    let mut conv = DepAwareConverter::new();
    for item in items {
        let deps = dep_count(&item);
        conv.insert(item, deps);
    }
    conv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_becomes_ready_in_order() {
        let mut conv = DepAwareConverter::new();
        conv.insert(0, 0);
        conv.insert(1, 1);
        conv.insert(2, 1);
        let mut order = Vec::new();
        conv.execute(|conv, item| {
            order.push(item);
            match item {
                0 => conv.mark_dep_ready(&1),
                1 => conv.mark_dep_ready(&2),
                _ => {}
            }
        });
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn unreachable_dependency_never_fires() {
        let mut conv = DepAwareConverter::new();
        conv.insert(0, 1);
        let mut ran = false;
        conv.execute(|_, _| ran = true);
        assert!(!ran);
        assert!(!conv.is_empty());
    }
}
