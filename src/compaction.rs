//! Cart compaction.
//!
//! The partition search grows with the Bell number of the item count, so
//! large carts are shrunk first: light items are merged, in encounter order,
//! into synthetic composite items until the anticipated search size drops
//! below a safety limit. If it does not, both thresholds are raised by one
//! step and compaction restarts from the original cart.

use serde::Serialize;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::OptimizationError;
use crate::estimate::{bell_number, max_items_within};
use crate::model::{Cart, Item};

/// A unit handed to the partition search: either an original item or a
/// sealed group of light items.
#[derive(Clone, Debug, PartialEq)]
pub struct CartUnit {
    pub label: String,
    pub mass: f64,
    /// Original items represented by this unit.
    pub contents: Vec<Item>,
}

impl CartUnit {
    pub fn from_item(item: &Item) -> Self {
        Self {
            label: item.id.clone(),
            mass: item.mass,
            contents: vec![item.clone()],
        }
    }

    fn sealed(contents: Vec<Item>, mass: f64) -> Self {
        if let [only] = contents.as_slice() {
            return Self::from_item(only);
        }
        Self {
            label: summarize_labels(&contents),
            mass,
            contents,
        }
    }

    pub fn is_composite(&self) -> bool {
        self.contents.len() > 1
    }
}

/// Builds a label such as `3 x screw + 1 x nut`, labels in first-seen order.
fn summarize_labels(items: &[Item]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(label, _)| *label == item.id) {
            Some((_, count)) => *count += 1,
            None => counts.push((&item.id, 1)),
        }
    }
    counts
        .iter()
        .map(|(label, count)| format!("{count} x {label}"))
        .collect::<Vec<_>>()
        .join(" + ")
}

/// Run-scoped compaction thresholds, raised across retries.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, ToSchema)]
pub struct CompactionState {
    /// Items strictly lighter than this are merged.
    pub light_item_threshold: f64,
    /// A merged group is sealed once its mass exceeds this.
    pub compaction_group_capacity: f64,
}

/// Result of an adaptive compaction run.
#[derive(Clone, Debug)]
pub struct CompactedCart {
    pub units: Vec<CartUnit>,
    pub state: CompactionState,
    pub attempts: usize,
}

impl CompactedCart {
    pub fn composite_count(&self) -> usize {
        self.units.iter().filter(|u| u.is_composite()).count()
    }
}

/// Shrinks carts until `B(n)` is within `partition_limit`.
#[derive(Clone, Copy, Debug)]
pub struct CartCompactor {
    initial: CompactionState,
    step: f64,
    partition_limit: u128,
    max_parcel_mass: f64,
}

impl CartCompactor {
    /// Smallest accepted retry increment.
    const MIN_STEP: f64 = 1e-3;

    pub fn new(
        initial: CompactionState,
        step: f64,
        partition_limit: u128,
        max_parcel_mass: f64,
    ) -> Self {
        let step = if step.is_finite() {
            step.max(Self::MIN_STEP)
        } else {
            Self::MIN_STEP
        };
        Self {
            initial: CompactionState {
                light_item_threshold: initial.light_item_threshold.min(max_parcel_mass),
                compaction_group_capacity: initial.compaction_group_capacity.min(max_parcel_mass),
            },
            step,
            partition_limit,
            max_parcel_mass,
        }
    }

    /// One compaction pass with fixed thresholds.
    ///
    /// Heavy items come first in cart order, followed by the sealed groups.
    /// A group is also sealed early if the next light item would push it
    /// above the maximum parcel mass, so synthetic items stay shippable.
    pub fn compact_once(&self, cart: &Cart, state: CompactionState) -> Vec<CartUnit> {
        let (light, heavy): (Vec<&Item>, Vec<&Item>) = cart
            .items()
            .iter()
            .partition(|item| item.mass < state.light_item_threshold);

        let mut units: Vec<CartUnit> = heavy.into_iter().map(CartUnit::from_item).collect();

        let mut pending: Vec<Item> = Vec::new();
        let mut pending_mass = 0.0;
        for item in light {
            if !pending.is_empty() && pending_mass + item.mass > self.max_parcel_mass {
                units.push(CartUnit::sealed(std::mem::take(&mut pending), pending_mass));
                pending_mass = 0.0;
            }
            pending.push(item.clone());
            pending_mass += item.mass;
            if pending_mass > state.compaction_group_capacity {
                units.push(CartUnit::sealed(std::mem::take(&mut pending), pending_mass));
                pending_mass = 0.0;
            }
        }
        if !pending.is_empty() {
            units.push(CartUnit::sealed(pending, pending_mass));
        }

        units
    }

    /// Compacts until the search is tractable, always restarting from the
    /// original cart.
    pub fn compact(&self, cart: &Cart) -> Result<CompactedCart, OptimizationError> {
        let mut state = self.initial;
        let mut attempts = 0;
        debug!(
            items = cart.len(),
            target = max_items_within(self.partition_limit),
            "compacting cart"
        );

        loop {
            attempts += 1;
            let units = self.compact_once(cart, state);
            let partitions = bell_number(units.len());
            debug!(
                attempt = attempts,
                light_item_threshold = state.light_item_threshold,
                compaction_group_capacity = state.compaction_group_capacity,
                units = units.len(),
                partitions = %partitions,
                "compaction pass"
            );

            if partitions <= self.partition_limit {
                return Ok(CompactedCart {
                    units,
                    state,
                    attempts,
                });
            }

            if state.light_item_threshold >= self.max_parcel_mass
                || state.compaction_group_capacity >= self.max_parcel_mass
            {
                return Err(OptimizationError::CannotCompact {
                    remaining: units.len(),
                    attempts,
                    limit: self.partition_limit,
                    max_parcel_mass: self.max_parcel_mass,
                });
            }

            state.light_item_threshold =
                (state.light_item_threshold + self.step).min(self.max_parcel_mass);
            state.compaction_group_capacity =
                (state.compaction_group_capacity + self.step).min(self.max_parcel_mass);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart(entries: &[(&str, f64)]) -> Cart {
        entries
            .iter()
            .map(|(id, mass)| Item::new(*id, *mass).unwrap())
            .collect()
    }

    fn state(light: f64, capacity: f64) -> CompactionState {
        CompactionState {
            light_item_threshold: light,
            compaction_group_capacity: capacity,
        }
    }

    fn total_mass(units: &[CartUnit]) -> f64 {
        units.iter().map(|u| u.mass).sum()
    }

    #[test]
    fn merges_light_items_until_capacity_exceeded() {
        let compactor = CartCompactor::new(state(2.0, 2.0), 1.0, 1_000, 30.0);
        let cart = cart(&[
            ("screw", 0.5),
            ("screw", 0.5),
            ("lamp", 12.0),
            ("nut", 0.8),
            ("screw", 0.5),
            ("nut", 0.8),
        ]);

        let units = compactor.compact_once(&cart, state(2.0, 2.0));

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].label, "lamp");
        // 0.5 + 0.5 + 0.8 = 1.8, + 0.5 = 2.3 > 2 -> sealed
        assert_eq!(units[1].label, "3 x screw + 1 x nut");
        assert!((units[1].mass - 2.3).abs() < 1e-9);
        // leftover partial group is sealed as the original item
        assert_eq!(units[2].label, "nut");
        assert!(!units[2].is_composite());
        assert!((total_mass(&units) - cart.total_mass()).abs() < 1e-9);
    }

    #[test]
    fn every_item_lands_in_exactly_one_unit() {
        let compactor = CartCompactor::new(state(3.0, 4.0), 1.0, 1_000, 30.0);
        let cart = cart(&[
            ("a", 1.0),
            ("b", 2.0),
            ("c", 5.0),
            ("d", 2.5),
            ("e", 0.0),
            ("f", 1.5),
        ]);

        let units = compactor.compact_once(&cart, state(3.0, 4.0));
        let mut ids: Vec<&str> = units
            .iter()
            .flat_map(|u| u.contents.iter().map(|i| i.id.as_str()))
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn compaction_is_idempotent() {
        let compactor = CartCompactor::new(state(2.0, 2.0), 1.0, 1_000, 30.0);
        let cart = cart(&[("a", 0.3), ("b", 1.9), ("c", 7.0), ("a", 0.3), ("d", 1.1)]);

        let first = compactor.compact_once(&cart, state(2.0, 3.0));
        let second = compactor.compact_once(&cart, state(2.0, 3.0));
        assert_eq!(first, second);
    }

    #[test]
    fn sealed_groups_never_exceed_max_parcel_mass() {
        let compactor = CartCompactor::new(state(9.0, 28.0), 1.0, 1_000, 30.0);
        let cart = cart(&[("a", 8.0), ("b", 8.0), ("c", 8.0), ("d", 8.0), ("e", 8.0)]);

        let units = compactor.compact_once(&cart, state(9.0, 28.0));
        assert!(units.iter().all(|u| u.mass <= 30.0));
        assert!((total_mass(&units) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn small_carts_pass_through_untouched() {
        let compactor = CartCompactor::new(state(2.0, 2.0), 1.0, bell_number(12), 30.0);
        let cart = cart(&[("a", 0.5), ("b", 5.0), ("c", 8.0)]);

        let compacted = compactor.compact(&cart).unwrap();
        assert_eq!(compacted.attempts, 1);
        assert_eq!(compacted.units.len(), 3);
        assert_eq!(compacted.composite_count(), 0);
    }

    #[test]
    fn raises_thresholds_until_tractable() {
        // 16 items of 2.5 kg: none is light at first, B(16) is far too large
        let entries: Vec<(&str, f64)> = (0..16).map(|_| ("brick", 2.5)).collect();
        let cart = cart(&entries);
        let limit = bell_number(8);
        let compactor = CartCompactor::new(state(2.0, 2.0), 1.0, limit, 30.0);

        let compacted = compactor.compact(&cart).unwrap();

        assert!(compacted.attempts > 1);
        assert!(bell_number(compacted.units.len()) <= limit);
        assert!(compacted.state.light_item_threshold > 2.5);
        assert!((total_mass(&compacted.units) - 40.0).abs() < 1e-9);
        let originals: usize = compacted.units.iter().map(|u| u.contents.len()).sum();
        assert_eq!(originals, 16);
    }

    #[test]
    fn fails_when_ceiling_reached() {
        // ten 29 kg items can never be merged under a 30 kg ceiling
        let entries: Vec<(&str, f64)> = (0..10).map(|_| ("crate", 29.0)).collect();
        let cart = cart(&entries);
        let compactor = CartCompactor::new(state(2.0, 2.0), 1.0, bell_number(5), 30.0);

        let err = compactor.compact(&cart).unwrap_err();
        match err {
            OptimizationError::CannotCompact {
                remaining,
                attempts,
                ..
            } => {
                assert_eq!(remaining, 10);
                assert_eq!(attempts, 29);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn initial_thresholds_are_clamped_to_ceiling() {
        let compactor = CartCompactor::new(state(50.0, 50.0), 1.0, 10, 30.0);
        let units = compactor.compact_once(&cart(&[("a", 1.0)]), compactor.initial);
        assert_eq!(units.len(), 1);
        assert_eq!(compactor.initial.light_item_threshold, 30.0);
    }
}
