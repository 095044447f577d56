//! Stable incremental merge of one source's results into the live list.
//!
//! Every source owns one contiguous segment of the list; a source seen for
//! the first time appends its segment at the end. Applying a source's new
//! results touches only its segment and produces the minimal sequence of
//! [`ListOp`]s the presentation layer replays on its own collection. A
//! record whose identity is unchanged is never removed and reinserted: it
//! keeps its `Arc` and is at most moved.

use std::collections::HashSet;
use std::sync::Arc;

use crate::model::WindowRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOp {
    Remove { index: usize },
    Insert { index: usize, record: Arc<WindowRecord> },
    Move { from: usize, to: usize },
}

impl ListOp {
    pub fn is_move(&self) -> bool {
        matches!(self, Self::Move { .. })
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    items: Vec<Arc<WindowRecord>>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Arc<WindowRecord>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replaces `source_id`'s segment with `records` (in source order).
    /// Records whose identity repeats an earlier one in `records` are
    /// dropped.
    pub fn apply(&mut self, source_id: &str, records: Vec<WindowRecord>) -> Vec<ListOp> {
        let mut seen = HashSet::with_capacity(records.len());
        let incoming: Vec<WindowRecord> = records
            .into_iter()
            .filter(|r| seen.insert(r.identity()))
            .map(|mut r| {
                if r.source_id != source_id {
                    r.source_id = source_id.to_string();
                }
                r
            })
            .collect();

        let mut ops = Vec::new();
        let start = self.segment_start(source_id);

        // Prune back to front so pending indices stay valid.
        let mut end = self.segment_end(source_id, start);
        for index in (start..end).rev() {
            if !seen.contains(&self.items[index].identity()) {
                self.items.remove(index);
                ops.push(ListOp::Remove { index });
                end -= 1;
            }
        }

        // Two-pointer align inside [start, end).
        let mut p = start;
        for record in incoming {
            if p < end && self.items[p].same_identity(&record) {
                p += 1;
                continue;
            }

            let found = (p + 1..end).find(|&j| self.items[j].same_identity(&record));
            match found {
                Some(j) => {
                    let item = self.items.remove(j);
                    self.items.insert(p, item);
                    ops.push(ListOp::Move { from: j, to: p });
                }
                None => {
                    let item = Arc::new(record);
                    self.items.insert(p, Arc::clone(&item));
                    ops.push(ListOp::Insert {
                        index: p,
                        record: item,
                    });
                    end += 1;
                }
            }
            p += 1;
        }
        debug_assert_eq!(p, end);

        ops
    }

    /// Drops every record owned by `source_id`.
    pub fn remove_source(&mut self, source_id: &str) -> Vec<ListOp> {
        self.apply(source_id, Vec::new())
    }

    fn segment_start(&self, source_id: &str) -> usize {
        self.items
            .iter()
            .position(|r| r.source_id == source_id)
            .unwrap_or(self.items.len())
    }

    fn segment_end(&self, source_id: &str, start: usize) -> usize {
        start
            + self.items[start..]
                .iter()
                .take_while(|r| r.source_id == source_id)
                .count()
    }
}

/// Replays `ops` on a mirror collection, the way a presentation layer would.
pub fn apply_ops(target: &mut Vec<Arc<WindowRecord>>, ops: &[ListOp]) {
    for op in ops {
        match op {
            ListOp::Remove { index } => {
                target.remove(*index);
            }
            ListOp::Insert { index, record } => target.insert(*index, Arc::clone(record)),
            ListOp::Move { from, to } => {
                let item = target.remove(*from);
                target.insert(*to, item);
            }
        }
    }
}
