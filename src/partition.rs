//! Exhaustive set-partition search.
//!
//! Finds the partition of a list of item masses into parcels that minimises
//! the summed tariff price. Items are placed one at a time, heaviest first:
//! each item either joins one of the groups already opened or opens a new
//! group. Every complete assignment is evaluated, so `B(n)` candidates are
//! visited in exhaustive mode.
//!
//! Items carry their origin index through the whole search, so identity is
//! never reconstructed from mass values afterwards.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::OptimizationError;
use crate::tariff::TariffTable;

/// Number of leading items whose assignments are fanned out to the rayon pool.
const PARALLEL_PREFIX_DEPTH: usize = 6;

/// A mass tagged with the position of its item in the caller's list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchItem {
    pub index: usize,
    pub mass: f64,
}

/// How candidate partitions are explored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Visit every partition.
    #[default]
    Exhaustive,
    /// Skip partial partitions that are infeasible or already too expensive.
    BranchAndBound,
}

impl SearchMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exhaustive" => Some(SearchMode::Exhaustive),
            "branch_and_bound" | "branch-and-bound" | "bnb" => Some(SearchMode::BranchAndBound),
            _ => None,
        }
    }
}

/// Parameters of one search run.
#[derive(Clone, Copy, Debug)]
pub struct SearchOptions {
    pub max_parcel_mass: f64,
    pub mode: SearchMode,
    pub parallel: bool,
}

/// Counters collected while searching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SearchStats {
    /// Complete partitions evaluated.
    pub explored: u64,
    /// Partial partitions discarded before completion.
    pub pruned: u64,
}

impl SearchStats {
    fn merge(&mut self, other: SearchStats) {
        self.explored += other.explored;
        self.pruned += other.pruned;
    }
}

/// Cheapest partition found.
#[derive(Clone, Debug)]
pub struct SearchOutcome {
    pub total_price: f64,
    /// Groups in creation order; members in insertion order.
    pub groups: Vec<Vec<SearchItem>>,
    pub stats: SearchStats,
}

#[derive(Clone, Debug)]
struct Group {
    mass: f64,
    members: Vec<usize>,
}

#[derive(Clone, Debug)]
struct Best {
    price: f64,
    groups: Vec<Vec<usize>>,
}

/// Partition search over a fixed tariff.
pub struct PartitionSearch<'a> {
    tariff: &'a TariffTable,
    options: SearchOptions,
}

impl<'a> PartitionSearch<'a> {
    pub fn new(tariff: &'a TariffTable, options: SearchOptions) -> Self {
        Self { tariff, options }
    }

    /// Returns the minimum-cost partition of `items`.
    ///
    /// Ties keep the first partition encountered; callers must not rely on
    /// which of several equally cheap partitions is returned.
    pub fn run(&self, items: &[SearchItem]) -> Result<SearchOutcome, OptimizationError> {
        if items.is_empty() {
            return Err(OptimizationError::EmptyInput);
        }

        let mut sorted = items.to_vec();
        sorted.sort_by(|a, b| {
            b.mass
                .partial_cmp(&a.mass)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });

        let walker = Walker {
            items: &sorted,
            tariff: self.tariff,
            max_parcel_mass: self.options.max_parcel_mass,
            prune_infeasible: self.options.mode == SearchMode::BranchAndBound,
            // cost bounds are only valid when adding mass never lowers a price
            prune_cost: self.options.mode == SearchMode::BranchAndBound
                && self.tariff.is_non_decreasing(),
        };

        let (best, stats) = if self.options.parallel && sorted.len() > PARALLEL_PREFIX_DEPTH {
            walker.run_parallel(PARALLEL_PREFIX_DEPTH)
        } else {
            let mut state = WalkState::default();
            walker.descend(0, &mut Vec::new(), &mut state);
            (state.best, state.stats)
        };

        // Only feasibility pruning can discard every branch, and only when a
        // single item is already above the ceiling.
        let Some(best) = best else {
            let heaviest = sorted[0];
            return Err(OptimizationError::ExcessiveItemMass {
                label: format!("#{}", heaviest.index),
                mass: heaviest.mass,
                max_parcel_mass: self.options.max_parcel_mass,
            });
        };

        let groups = best
            .groups
            .into_iter()
            .map(|members| members.into_iter().map(|pos| sorted[pos]).collect())
            .collect();

        Ok(SearchOutcome {
            total_price: best.price,
            groups,
            stats,
        })
    }
}

#[derive(Default)]
struct WalkState {
    best: Option<Best>,
    stats: SearchStats,
}

impl WalkState {
    fn best_price(&self) -> f64 {
        self.best.as_ref().map_or(f64::INFINITY, |b| b.price)
    }
}

struct Walker<'s> {
    items: &'s [SearchItem],
    tariff: &'s TariffTable,
    max_parcel_mass: f64,
    prune_infeasible: bool,
    prune_cost: bool,
}

impl Walker<'_> {
    fn group_price(&self, group: &Group) -> f64 {
        if group.mass > self.max_parcel_mass {
            f64::INFINITY
        } else {
            self.tariff.price_for(group.mass)
        }
    }

    fn partition_price(&self, groups: &[Group]) -> f64 {
        groups.iter().map(|g| self.group_price(g)).sum()
    }

    fn descend(&self, depth: usize, groups: &mut Vec<Group>, state: &mut WalkState) {
        if depth == self.items.len() {
            self.evaluate(groups, state);
            return;
        }

        let mass = self.items[depth].mass;

        for j in 0..groups.len() {
            let previous = groups[j].mass;
            groups[j].mass += mass;
            groups[j].members.push(depth);

            if self.should_prune(groups, j, state) {
                state.stats.pruned += 1;
            } else {
                self.descend(depth + 1, groups, state);
            }

            groups[j].members.pop();
            // restore instead of subtracting to keep sums exact
            groups[j].mass = previous;
        }

        groups.push(Group {
            mass,
            members: vec![depth],
        });
        let last = groups.len() - 1;
        if self.should_prune(groups, last, state) {
            state.stats.pruned += 1;
        } else {
            self.descend(depth + 1, groups, state);
        }
        groups.pop();
    }

    fn should_prune(&self, groups: &[Group], touched: usize, state: &WalkState) -> bool {
        if self.prune_infeasible && groups[touched].mass > self.max_parcel_mass {
            return true;
        }
        self.prune_cost
            && state.best.is_some()
            && self.partition_price(groups) >= state.best_price()
    }

    fn evaluate(&self, groups: &[Group], state: &mut WalkState) {
        state.stats.explored += 1;
        let price = self.partition_price(groups);
        if state.best.is_none() || price < state.best_price() {
            state.best = Some(Best {
                price,
                groups: groups.iter().map(|g| g.members.clone()).collect(),
            });
        }
    }

    /// Collects the group states reached after placing the first `depth`
    /// items, in the order the sequential walk would visit them.
    fn prefixes(&self, depth: usize) -> Vec<Vec<Group>> {
        fn collect(
            walker: &Walker<'_>,
            level: usize,
            target: usize,
            groups: &mut Vec<Group>,
            out: &mut Vec<Vec<Group>>,
        ) {
            if level == target {
                out.push(groups.clone());
                return;
            }
            let mass = walker.items[level].mass;
            for j in 0..groups.len() {
                let previous = groups[j].mass;
                groups[j].mass += mass;
                groups[j].members.push(level);
                collect(walker, level + 1, target, groups, out);
                groups[j].members.pop();
                groups[j].mass = previous;
            }
            groups.push(Group {
                mass,
                members: vec![level],
            });
            collect(walker, level + 1, target, groups, out);
            groups.pop();
        }

        let mut out = Vec::new();
        collect(self, 0, depth, &mut Vec::new(), &mut out);
        out
    }

    /// Explores every prefix subtree on the rayon pool and merges the
    /// winners in prefix order, so ties resolve as in the sequential walk.
    fn run_parallel(&self, depth: usize) -> (Option<Best>, SearchStats) {
        let prefixes = self.prefixes(depth);
        let partials: Vec<WalkState> = prefixes
            .into_par_iter()
            .map(|mut groups| {
                let mut state = WalkState::default();
                let infeasible = self.prune_infeasible
                    && groups.iter().any(|g| g.mass > self.max_parcel_mass);
                if infeasible {
                    state.stats.pruned += 1;
                } else {
                    self.descend(depth, &mut groups, &mut state);
                }
                state
            })
            .collect();

        let mut merged = WalkState::default();
        for partial in partials {
            merged.stats.merge(partial.stats);
            if let Some(candidate) = partial.best {
                if merged.best.is_none() || candidate.price < merged.best_price() {
                    merged.best = Some(candidate);
                }
            }
        }
        (merged.best, merged.stats)
    }
}
