// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-workspace fair queue: FIFO per owner, round-robin across owners.

use ap_core::OwnerKey;
use std::collections::HashMap;

/// Round-robin queue over per-owner FIFO lists.
///
/// Invariants: an owner appears in `order` iff its list is non-empty;
/// `total` equals the sum of list lengths; `cursor` always indexes into
/// `order` while any owner remains.
///
/// Generic over the entry payload so the scheduling logic stays testable
/// without dragging in continuations.
#[derive(Debug)]
pub struct WorkspaceQueue<T> {
    owners: HashMap<OwnerKey, Vec<T>>,
    /// Owner keys in first-enqueue order; the cursor walks this.
    order: Vec<OwnerKey>,
    cursor: usize,
    total: usize,
}

impl<T> Default for WorkspaceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkspaceQueue<T> {
    pub fn new() -> Self {
        Self {
            owners: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
            total: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn queued_for(&self, owner: &OwnerKey) -> usize {
        self.owners.get(owner).map_or(0, Vec::len)
    }

    /// Owners currently in rotation, in `order` order.
    pub fn owners_in_order(&self) -> Vec<OwnerKey> {
        self.order.clone()
    }

    /// Append to the owner's FIFO; a new owner joins the rotation at the
    /// back of `order`.
    pub fn enqueue(&mut self, owner: OwnerKey, item: T) {
        let list = self.owners.entry(owner.clone()).or_default();
        if list.is_empty() {
            self.order.push(owner);
        }
        list.push(item);
        self.total += 1;
    }

    /// Pop the head of the next eligible owner's list, round-robin from
    /// the cursor. Ineligible owners are skipped this pass without losing
    /// their place in the rotation.
    pub fn pop_eligible(&mut self, mut eligible: impl FnMut(&OwnerKey) -> bool) -> Option<T> {
        let len = self.order.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            let owner = self.order[idx].clone();
            if !eligible(&owner) {
                continue;
            }
            let list = self.owners.get_mut(&owner)?;
            let item = list.remove(0);
            self.total -= 1;
            self.cursor = (idx + 1) % len;
            if list.is_empty() {
                self.remove_from_order(&owner, idx);
            }
            return Some(item);
        }
        None
    }

    /// Round-robin pop with every owner eligible.
    pub fn pop(&mut self) -> Option<T> {
        self.pop_eligible(|_| true)
    }

    /// Put an item back at the head of its owner's list after a dispatch
    /// attempt deferred. The owner is served next: its failed pop must
    /// not cost it its turn.
    pub fn requeue_front(&mut self, owner: OwnerKey, item: T) {
        let list = self.owners.entry(owner.clone()).or_default();
        let was_absent = list.is_empty();
        list.insert(0, item);
        self.total += 1;
        if was_absent {
            let idx = self.cursor.min(self.order.len());
            self.order.insert(idx, owner);
        } else if let Some(pos) = self.order.iter().position(|o| o == &owner) {
            self.cursor = pos;
        }
    }

    /// Remove the first item matching the predicate, e.g. an aborted
    /// queued request. Returns the item with its owner.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<(OwnerKey, T)> {
        let mut found: Option<(usize, OwnerKey, usize)> = None;
        'outer: for (order_idx, owner) in self.order.iter().enumerate() {
            if let Some(list) = self.owners.get(owner) {
                for (item_idx, item) in list.iter().enumerate() {
                    if pred(item) {
                        found = Some((order_idx, owner.clone(), item_idx));
                        break 'outer;
                    }
                }
            }
        }
        let (order_idx, owner, item_idx) = found?;
        let list = self.owners.get_mut(&owner)?;
        let item = list.remove(item_idx);
        self.total -= 1;
        if list.is_empty() {
            self.remove_from_order(&owner, order_idx);
        }
        Some((owner, item))
    }

    /// Take everything in rotation order, clearing the queue.
    pub fn drain_all(&mut self) -> Vec<(OwnerKey, T)> {
        let mut out = Vec::with_capacity(self.total);
        for owner in std::mem::take(&mut self.order) {
            if let Some(list) = self.owners.remove(&owner) {
                for item in list {
                    out.push((owner.clone(), item));
                }
            }
        }
        self.cursor = 0;
        self.total = 0;
        out
    }

    /// Drop a drained owner from the rotation, keeping the cursor aimed at
    /// whichever owner was next.
    fn remove_from_order(&mut self, owner: &OwnerKey, order_idx: usize) {
        self.owners.remove(owner);
        self.order.remove(order_idx);
        if self.order.is_empty() {
            self.cursor = 0;
        } else {
            if order_idx < self.cursor {
                self.cursor -= 1;
            }
            self.cursor %= self.order.len();
        }
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
