// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
//! Cluster-selection strategies for the cluster-wrapping searcher.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mapper::ClusterId;

/// Picks which cluster the outer searcher advances next.
pub trait SearcherStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId>;
    fn add_cluster(&mut self, cluster: ClusterId);
    fn remove_cluster(&mut self, cluster: ClusterId);
}

/// Always the first governed cluster.
#[derive(Debug, Default)]
pub struct NullStrategy {
    clusters: Vec<ClusterId>,
}

impl SearcherStrategy for NullStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId> {
        self.clusters.first().copied()
    }

    fn add_cluster(&mut self, cluster: ClusterId) {
        self.clusters.push(cluster);
    }

    fn remove_cluster(&mut self, cluster: ClusterId) {
        self.clusters.retain(|c| *c != cluster);
    }
}

/// Round robin; the cursor survives deletions of the cluster it points at.
#[derive(Debug, Default)]
pub struct FifoStrategy {
    clusters: BTreeSet<ClusterId>,
    cursor: Option<ClusterId>,
}

impl SearcherStrategy for FifoStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId> {
        let next = match self.cursor {
            Some(cur) => self
                .clusters
                .range((Bound::Excluded(cur), Bound::Unbounded))
                .next()
                .copied()
                .or_else(|| self.clusters.iter().next().copied()),
            None => self.clusters.iter().next().copied(),
        };
        self.cursor = next;
        next
    }

    fn add_cluster(&mut self, cluster: ClusterId) {
        self.clusters.insert(cluster);
    }

    fn remove_cluster(&mut self, cluster: ClusterId) {
        self.clusters.remove(&cluster);
    }
}

/// Uniformly random pick; O(1) add and remove via swap-with-last.
#[derive(Debug)]
pub struct RandomStrategy {
    lookup: Vec<ClusterId>,
    index: HashMap<ClusterId, usize>,
    rng: StdRng,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        RandomStrategy {
            lookup: Vec::new(),
            index: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl SearcherStrategy for RandomStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId> {
        if self.lookup.is_empty() {
            return None;
        }
        let k = self.rng.gen_range(0..self.lookup.len());
        Some(self.lookup[k])
    }

    fn add_cluster(&mut self, cluster: ClusterId) {
        self.index.insert(cluster, self.lookup.len());
        self.lookup.push(cluster);
    }

    fn remove_cluster(&mut self, cluster: ClusterId) {
        if let Some(gap) = self.index.remove(&cluster) {
            let last = self.lookup.pop().expect("non-empty lookup");
            if last != cluster {
                self.lookup[gap] = last;
                self.index.insert(last, gap);
            }
        }
    }
}

/// Weighted mix of sub-strategies: each component is consulted for its
/// weight's worth of consecutive picks, round robin over components.
pub struct MangleStrategy {
    components: Vec<(Box<dyn SearcherStrategy>, usize)>,
    current: usize,
    remaining: usize,
}

impl MangleStrategy {
    pub fn new(components: Vec<(Box<dyn SearcherStrategy>, usize)>) -> Self {
        assert!(!components.is_empty());
        assert!(components.iter().all(|(_, weight)| *weight > 0));
        MangleStrategy {
            current: components.len() - 1,
            remaining: 0,
            components,
        }
    }
}

impl SearcherStrategy for MangleStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId> {
        if self.remaining == 0 {
            self.current = (self.current + 1) % self.components.len();
            self.remaining = self.components[self.current].1;
        }
        self.remaining -= 1;
        self.components[self.current].0.select_cluster()
    }

    fn add_cluster(&mut self, cluster: ClusterId) {
        for (c, _) in &mut self.components {
            c.add_cluster(cluster);
        }
    }

    fn remove_cluster(&mut self, cluster: ClusterId) {
        for (c, _) in &mut self.components {
            c.remove_cluster(cluster);
        }
    }
}

/// Repeat the underlying strategy's pick for N consecutive selections.
pub struct RepeatStrategy {
    inner: Box<dyn SearcherStrategy>,
    repeat: usize,
    streak: usize,
    current: Option<ClusterId>,
}

impl RepeatStrategy {
    pub fn new(inner: Box<dyn SearcherStrategy>, repeat: usize) -> Self {
        assert!(repeat > 0);
        RepeatStrategy {
            inner,
            repeat,
            streak: 0,
            current: None,
        }
    }
}

impl SearcherStrategy for RepeatStrategy {
    fn select_cluster(&mut self) -> Option<ClusterId> {
        if self.streak == 0 {
            self.streak = self.repeat;
            self.current = self.inner.select_cluster();
        }
        self.streak -= 1;
        self.current
    }

    fn add_cluster(&mut self, cluster: ClusterId) {
        self.inner.add_cluster(cluster);
    }

    fn remove_cluster(&mut self, cluster: ClusterId) {
        self.inner.remove_cluster(cluster);
        if self.current == Some(cluster) {
            // do not keep serving a dead pick
            self.current = None;
            self.streak = 0;
        }
    }
}
