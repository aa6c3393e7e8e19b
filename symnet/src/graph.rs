// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Incremental bipartite dependency graph between path constraints and the
//! symbolic arrays they read.
//!
//! Edges are added as constraints join the constraint manager and never
//! removed; after [`ConstraintsGraph::update`] every constraint below the
//! high-water mark is fully edged. The closure query is a plain BFS over
//! the two partitions, yielding the minimal set of constraints that
//! (transitively) touch a requested symbol set.

use std::collections::{HashMap, HashSet, VecDeque};

use symnet_shared::expr::visit::collect_arrays;
use symnet_shared::expr::{ArrayRef, ExprRef};

use crate::executor::ConstraintManager;

#[derive(Debug, Clone, Default)]
pub struct ConstraintsGraph {
    known_constraints: usize,
    by_array: HashMap<ArrayRef, Vec<usize>>,
    by_constraint: Vec<Vec<ArrayRef>>,
}

impl ConstraintsGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Ingest constraints added to `cm` since the last update.
    pub fn update(&mut self, cm: &ConstraintManager) {
        for index in self.known_constraints..cm.len() {
            let constraint = cm.get(index).expect("index below len");
            let mut arrays = Vec::new();
            collect_arrays(constraint, &mut |a| {
                if !arrays.contains(a) {
                    arrays.push(a.clone());
                }
            });
            for a in &arrays {
                self.by_array.entry(a.clone()).or_default().push(index);
            }
            self.by_constraint.push(arrays);
        }
        self.known_constraints = cm.len();
    }

    /// The closure of constraints reachable from `request` in the bipartite
    /// graph, in constraint order. Updates the graph first.
    pub fn eval<'a>(
        &mut self,
        cm: &ConstraintManager,
        request: impl IntoIterator<Item = &'a ArrayRef>,
    ) -> Vec<ExprRef> {
        self.update(cm);

        let mut seen_arrays: HashSet<ArrayRef> = HashSet::new();
        let mut seen_constraints: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<ArrayRef> = VecDeque::new();
        for a in request {
            if seen_arrays.insert(a.clone()) {
                queue.push_back(a.clone());
            }
        }

        while let Some(array) = queue.pop_front() {
            let Some(indices) = self.by_array.get(&array) else {
                continue;
            };
            for &ci in indices {
                if !seen_constraints.insert(ci) {
                    continue;
                }
                for other in &self.by_constraint[ci] {
                    if seen_arrays.insert(other.clone()) {
                        queue.push_back(other.clone());
                    }
                }
            }
        }

        let mut indices: Vec<usize> = seen_constraints.into_iter().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|i| cm.get(i).expect("edged constraint exists").clone())
            .collect()
    }
}
