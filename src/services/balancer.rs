//! Priority/weight channel selection with failover.
//!
//! Candidates are split into tiers by ascending priority. Inside a tier each
//! pick is weighted-random over the items not yet tried; once a tier is used
//! up the next tier is entered. A channel that failed is skipped for the rest
//! of the relay even if it appears again under another model name.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::group::GroupItem;

pub struct Balancer<R: Rng = StdRng> {
    tiers: Vec<Vec<GroupItem>>,
    failed: HashSet<i64>,
    rng: R,
}

impl Balancer {
    pub fn new(items: Vec<GroupItem>) -> Self {
        Self::with_rng(items, StdRng::from_entropy())
    }
}

impl<R: Rng> Balancer<R> {
    pub fn with_rng(mut items: Vec<GroupItem>, rng: R) -> Self {
        items.sort_by_key(|i| (i.priority, i.id));
        let mut tiers: Vec<Vec<GroupItem>> = Vec::new();
        for item in items {
            match tiers.last_mut() {
                Some(tier) if tier[0].priority == item.priority => tier.push(item),
                _ => tiers.push(vec![item]),
            }
        }
        Self {
            tiers,
            failed: HashSet::new(),
            rng,
        }
    }

    /// Exclude a channel from every later pick.
    pub fn mark_failed(&mut self, channel_id: i64) {
        self.failed.insert(channel_id);
    }

    /// Items still eligible, for diagnostics.
    pub fn remaining(&self) -> usize {
        self.tiers
            .iter()
            .flatten()
            .filter(|i| !self.failed.contains(&i.channel_id))
            .count()
    }

    /// Next candidate, or `None` when every tier is exhausted.
    pub fn next_item(&mut self) -> Option<GroupItem> {
        loop {
            let failed = &self.failed;
            let tier = self.tiers.first_mut()?;
            tier.retain(|i| !failed.contains(&i.channel_id));
            if tier.is_empty() {
                self.tiers.remove(0);
                continue;
            }
            let pos = pick_weighted(tier, &mut self.rng);
            return Some(tier.remove(pos));
        }
    }
}

/// Index of a weighted-random pick. Non-positive weights count as 1 so a
/// misconfigured item is still reachable.
fn pick_weighted<R: Rng>(tier: &[GroupItem], rng: &mut R) -> usize {
    let total: i64 = tier.iter().map(|i| i.weight.max(1) as i64).sum();
    let mut roll = rng.gen_range(0..total);
    for (pos, item) in tier.iter().enumerate() {
        let w = item.weight.max(1) as i64;
        if roll < w {
            return pos;
        }
        roll -= w;
    }
    tier.len() - 1
}
