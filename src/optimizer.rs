//! Parcel consolidation pipeline.
//!
//! Ties the pieces together for one calculation request:
//! - rejects items that cannot ship on their own
//! - compacts the cart until the search is tractable
//! - asks for confirmation before very large searches
//! - runs the partition search and restores item identities

use serde::Serialize;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::compaction::{CartCompactor, CartUnit, CompactedCart, CompactionState};
use crate::correlate::LabelCorrelator;
use crate::error::OptimizationError;
use crate::estimate::{DEFAULT_SECONDS_PER_PARTITION, bell_number, estimated_seconds};
use crate::gate::{Confirm, ConfirmationGate};
use crate::model::{Cart, Item};
use crate::partition::{PartitionSearch, SearchMode, SearchOptions, SearchStats};
use crate::tariff::TariffTable;

/// Tunables of the optimizer.
#[derive(Copy, Clone, Debug)]
pub struct OptimizerConfig {
    /// Ceiling for a single parcel (kg)
    pub max_parcel_mass: f64,
    /// Partition count above which the operator is asked first
    pub warning_threshold: u128,
    /// Partition count the compactor must get below
    pub compaction_limit: u128,
    /// Initial light-item threshold of the compactor (kg)
    pub light_item_threshold: f64,
    /// Initial group capacity of the compactor (kg)
    pub compaction_group_capacity: f64,
    /// Increment applied to both compactor thresholds per retry (kg)
    pub compaction_step: f64,
    /// Calibrated cost of evaluating one partition (s)
    pub seconds_per_partition: f64,
    pub compaction: bool,
    pub search_mode: SearchMode,
    pub parallel_search: bool,
}

impl OptimizerConfig {
    pub const DEFAULT_MAX_PARCEL_MASS: f64 = 30.0;
    pub const DEFAULT_WARNING_THRESHOLD: u128 = 10_000;
    /// `B(12)`
    pub const DEFAULT_COMPACTION_LIMIT: u128 = 4_213_597;
    pub const DEFAULT_LIGHT_ITEM_THRESHOLD: f64 = 2.0;
    pub const DEFAULT_COMPACTION_GROUP_CAPACITY: f64 = 2.0;
    pub const DEFAULT_COMPACTION_STEP: f64 = 1.0;
    pub const DEFAULT_SECONDS_PER_PARTITION: f64 = DEFAULT_SECONDS_PER_PARTITION;

    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::default()
    }

    fn compaction_state(&self) -> CompactionState {
        CompactionState {
            light_item_threshold: self.light_item_threshold,
            compaction_group_capacity: self.compaction_group_capacity,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_parcel_mass: Self::DEFAULT_MAX_PARCEL_MASS,
            warning_threshold: Self::DEFAULT_WARNING_THRESHOLD,
            compaction_limit: Self::DEFAULT_COMPACTION_LIMIT,
            light_item_threshold: Self::DEFAULT_LIGHT_ITEM_THRESHOLD,
            compaction_group_capacity: Self::DEFAULT_COMPACTION_GROUP_CAPACITY,
            compaction_step: Self::DEFAULT_COMPACTION_STEP,
            seconds_per_partition: Self::DEFAULT_SECONDS_PER_PARTITION,
            compaction: true,
            search_mode: SearchMode::Exhaustive,
            parallel_search: false,
        }
    }
}

/// Builder for [`OptimizerConfig`].
#[derive(Clone, Debug, Default)]
pub struct OptimizerConfigBuilder {
    config: OptimizerConfig,
}

impl OptimizerConfigBuilder {
    pub fn max_parcel_mass(mut self, mass: f64) -> Self {
        self.config.max_parcel_mass = mass;
        self
    }

    pub fn warning_threshold(mut self, partitions: u128) -> Self {
        self.config.warning_threshold = partitions;
        self
    }

    pub fn compaction_limit(mut self, partitions: u128) -> Self {
        self.config.compaction_limit = partitions;
        self
    }

    pub fn light_item_threshold(mut self, mass: f64) -> Self {
        self.config.light_item_threshold = mass;
        self
    }

    pub fn compaction_group_capacity(mut self, mass: f64) -> Self {
        self.config.compaction_group_capacity = mass;
        self
    }

    pub fn compaction_step(mut self, step: f64) -> Self {
        self.config.compaction_step = step;
        self
    }

    pub fn seconds_per_partition(mut self, seconds: f64) -> Self {
        self.config.seconds_per_partition = seconds;
        self
    }

    /// Enables or disables cart compaction.
    pub fn compaction(mut self, enabled: bool) -> Self {
        self.config.compaction = enabled;
        self
    }

    pub fn search_mode(mut self, mode: SearchMode) -> Self {
        self.config.search_mode = mode;
        self
    }

    /// Explores the top of the partition tree on the rayon pool.
    pub fn parallel_search(mut self, enabled: bool) -> Self {
        self.config.parallel_search = enabled;
        self
    }

    pub fn build(self) -> OptimizerConfig {
        self.config
    }
}

/// One parcel of the cheapest consolidation.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ParcelGroup {
    /// Summed mass in kg
    pub mass: f64,
    pub price: f64,
    /// Labels of the units in this parcel; merged light items carry a
    /// summary label such as `3 x screw`
    pub labels: Vec<String>,
    /// Original cart items in this parcel
    pub items: Vec<Item>,
}

/// How the cart was shrunk before searching.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct CompactionSummary {
    pub original_items: usize,
    pub compacted_items: usize,
    /// Units that merge several light items
    pub composite_items: usize,
    pub light_item_threshold: f64,
    pub compaction_group_capacity: f64,
    pub attempts: usize,
}

impl CompactionSummary {
    fn new(original_items: usize, compacted: &CompactedCart) -> Self {
        Self {
            original_items,
            compacted_items: compacted.units.len(),
            composite_items: compacted.composite_count(),
            light_item_threshold: compacted.state.light_item_threshold,
            compaction_group_capacity: compacted.state.compaction_group_capacity,
            attempts: compacted.attempts,
        }
    }
}

/// Cheapest consolidation of a cart.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct OptimizationResult {
    pub total_price: f64,
    pub groups: Vec<ParcelGroup>,
    pub stats: SearchStats,
    pub compaction: Option<CompactionSummary>,
}

impl OptimizationResult {
    /// Result for an empty cart: nothing to ship, nothing to pay.
    pub fn empty() -> Self {
        Self {
            total_price: 0.0,
            groups: Vec::new(),
            stats: SearchStats::default(),
            compaction: None,
        }
    }

    pub fn parcel_count(&self) -> usize {
        self.groups.len()
    }

    pub fn total_mass(&self) -> f64 {
        self.groups.iter().map(|g| g.mass).sum()
    }
}

/// Progress of one optimization, suitable for streaming.
#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(tag = "type")]
pub enum OptimizeEvent {
    /// Light items were merged into composite units.
    CartCompacted {
        original_items: usize,
        compacted_items: usize,
        light_item_threshold: f64,
        compaction_group_capacity: f64,
        attempts: usize,
    },
    /// Size of the upcoming search.
    SearchEstimated {
        items: usize,
        partitions: u64,
        estimated_seconds: f64,
    },
    /// The worker waits for an operator answer.
    ConfirmationRequested {
        partitions: u64,
        estimated_seconds: f64,
        message: String,
    },
    SearchStarted {
        items: usize,
        mode: SearchMode,
        parallel: bool,
    },
    Finished {
        total_price: f64,
        parcels: usize,
        explored: u64,
        pruned: u64,
    },
    /// The operator declined the search.
    Aborted { partitions: u64 },
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

/// Finds the cheapest way to ship `cart` under `tariff`.
///
/// Searches with more than `warning_threshold` candidate partitions are
/// only run if `confirm` agrees. An empty cart costs nothing.
///
/// # Example
///
/// ```
/// use parcel_optimizer::gate::AlwaysConfirm;
/// use parcel_optimizer::model::{Cart, Item};
/// use parcel_optimizer::optimizer::optimize;
/// use parcel_optimizer::tariff::TariffTable;
///
/// let cart: Cart = [14.0, 14.0, 3.0, 12.0]
///     .iter()
///     .enumerate()
///     .map(|(i, &mass)| Item::new(format!("item-{i}"), mass).unwrap())
///     .collect();
/// let tariff = TariffTable::reference(30.0);
///
/// let result = optimize(&cart, &tariff, 30.0, 10_000, &AlwaysConfirm).unwrap();
/// assert!((result.total_price - 25.44).abs() < 1e-9);
/// assert_eq!(result.parcel_count(), 2);
/// ```
pub fn optimize<C>(
    cart: &Cart,
    tariff: &TariffTable,
    max_parcel_mass: f64,
    warning_threshold: u128,
    confirm: &C,
) -> Result<OptimizationResult, OptimizationError>
where
    C: Confirm + ?Sized,
{
    let config = OptimizerConfig::builder()
        .max_parcel_mass(max_parcel_mass)
        .warning_threshold(warning_threshold)
        .build();
    optimize_with_config(cart, tariff, config, confirm)
}

/// Like [`optimize`], with every tunable exposed.
pub fn optimize_with_config<C>(
    cart: &Cart,
    tariff: &TariffTable,
    config: OptimizerConfig,
    confirm: &C,
) -> Result<OptimizationResult, OptimizationError>
where
    C: Confirm + ?Sized,
{
    optimize_with_progress(cart, tariff, config, confirm, |_| {})
}

/// Like [`optimize_with_config`], reporting each step to `on_event`.
pub fn optimize_with_progress<C>(
    cart: &Cart,
    tariff: &TariffTable,
    config: OptimizerConfig,
    confirm: &C,
    mut on_event: impl FnMut(&OptimizeEvent),
) -> Result<OptimizationResult, OptimizationError>
where
    C: Confirm + ?Sized,
{
    if cart.is_empty() {
        on_event(&OptimizeEvent::Finished {
            total_price: 0.0,
            parcels: 0,
            explored: 0,
            pruned: 0,
        });
        return Ok(OptimizationResult::empty());
    }

    for item in cart.items() {
        ensure_shippable(&item.id, item.mass, tariff, config.max_parcel_mass)?;
    }

    let (units, compaction) = if config.compaction {
        let compactor = CartCompactor::new(
            config.compaction_state(),
            config.compaction_step,
            config.compaction_limit,
            config.max_parcel_mass,
        );
        let compacted = compactor.compact(cart)?;
        let summary = CompactionSummary::new(cart.len(), &compacted);
        if summary.compacted_items < summary.original_items {
            debug!(
                from = summary.original_items,
                to = summary.compacted_items,
                attempts = summary.attempts,
                "cart compacted"
            );
            on_event(&OptimizeEvent::CartCompacted {
                original_items: summary.original_items,
                compacted_items: summary.compacted_items,
                light_item_threshold: summary.light_item_threshold,
                compaction_group_capacity: summary.compaction_group_capacity,
                attempts: summary.attempts,
            });
        }
        (compacted.units, Some(summary))
    } else {
        let units: Vec<CartUnit> = cart.items().iter().map(CartUnit::from_item).collect();
        (units, None)
    };

    // merged units may land in a bracket the tariff cannot price
    for unit in &units {
        ensure_shippable(&unit.label, unit.mass, tariff, config.max_parcel_mass)?;
    }

    let partitions = bell_number(units.len());
    let seconds = estimated_seconds(partitions, config.seconds_per_partition);
    debug!(
        items = units.len(),
        partitions = %partitions,
        estimated_seconds = seconds,
        "search estimated"
    );
    on_event(&OptimizeEvent::SearchEstimated {
        items: units.len(),
        partitions: saturating_u64(partitions),
        estimated_seconds: seconds,
    });

    let mut gate = ConfirmationGate::new(config.warning_threshold, config.seconds_per_partition);
    if let Err(err) = gate.check(units.len(), partitions, confirm, |prompt| {
        on_event(&OptimizeEvent::ConfirmationRequested {
            partitions: saturating_u64(prompt.partitions),
            estimated_seconds: prompt.estimated_seconds,
            message: prompt.message.clone(),
        })
    }) {
        on_event(&OptimizeEvent::Aborted {
            partitions: saturating_u64(partitions),
        });
        return Err(err);
    }

    on_event(&OptimizeEvent::SearchStarted {
        items: units.len(),
        mode: config.search_mode,
        parallel: config.parallel_search,
    });
    let search = PartitionSearch::new(
        tariff,
        SearchOptions {
            max_parcel_mass: config.max_parcel_mass,
            mode: config.search_mode,
            parallel: config.parallel_search,
        },
    );
    let outcome = search.run(&LabelCorrelator::search_items(&units))?;

    let mut correlator = LabelCorrelator::new(&units);
    let mut groups = Vec::with_capacity(outcome.groups.len());
    for members in &outcome.groups {
        let claimed = correlator.claim_group(members)?;
        // same summation order as the search
        let mass: f64 = members.iter().map(|m| m.mass).sum();
        groups.push(ParcelGroup {
            mass,
            price: tariff.price_for(mass),
            labels: claimed.iter().map(|unit| unit.label.clone()).collect(),
            items: claimed
                .iter()
                .flat_map(|unit| unit.contents.iter().cloned())
                .collect(),
        });
    }
    correlator.finish()?;

    info!(
        items = cart.len(),
        parcels = groups.len(),
        total_price = outcome.total_price,
        explored = outcome.stats.explored,
        pruned = outcome.stats.pruned,
        "consolidation finished"
    );
    on_event(&OptimizeEvent::Finished {
        total_price: outcome.total_price,
        parcels: groups.len(),
        explored: outcome.stats.explored,
        pruned: outcome.stats.pruned,
    });

    Ok(OptimizationResult {
        total_price: outcome.total_price,
        groups,
        stats: outcome.stats,
        compaction,
    })
}

fn ensure_shippable(
    label: &str,
    mass: f64,
    tariff: &TariffTable,
    max_parcel_mass: f64,
) -> Result<(), OptimizationError> {
    if mass > max_parcel_mass || tariff.price_for(mass).is_infinite() {
        return Err(OptimizationError::ExcessiveItemMass {
            label: label.to_string(),
            mass,
            max_parcel_mass,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::gate::{AlwaysConfirm, NeverConfirm};

    fn cart_of(masses: &[f64]) -> Cart {
        masses
            .iter()
            .enumerate()
            .map(|(i, &mass)| Item::new(format!("item-{i}"), mass).unwrap())
            .collect()
    }

    /// Independent minimum over all restricted-growth strings.
    fn brute_force_minimum(masses: &[f64], tariff: &TariffTable, max: f64) -> f64 {
        fn walk(
            pos: usize,
            labels: &mut Vec<usize>,
            masses: &[f64],
            tariff: &TariffTable,
            max: f64,
            best: &mut f64,
        ) {
            if pos == masses.len() {
                let groups = labels.iter().copied().max().map_or(0, |m| m + 1);
                let mut total = 0.0;
                for g in 0..groups {
                    let mass: f64 = masses
                        .iter()
                        .zip(labels.iter())
                        .filter(|(_, l)| **l == g)
                        .map(|(m, _)| *m)
                        .sum();
                    total += if mass > max {
                        f64::INFINITY
                    } else {
                        tariff.price_for(mass)
                    };
                }
                if total < *best {
                    *best = total;
                }
                return;
            }
            let next = labels.iter().copied().max().map_or(0, |m| m + 1);
            for label in 0..=next {
                labels.push(label);
                walk(pos + 1, labels, masses, tariff, max, best);
                labels.pop();
            }
        }

        let mut best = f64::INFINITY;
        walk(0, &mut Vec::new(), masses, tariff, max, &mut best);
        best
    }

    fn assert_complete(cart: &Cart, result: &OptimizationResult) {
        let mut expected: Vec<(String, u64)> = cart
            .items()
            .iter()
            .map(|i| (i.id.clone(), i.mass.to_bits()))
            .collect();
        let mut actual: Vec<(String, u64)> = result
            .groups
            .iter()
            .flat_map(|g| g.items.iter().map(|i| (i.id.clone(), i.mass.to_bits())))
            .collect();
        expected.sort();
        actual.sort();
        assert_eq!(expected, actual, "items lost or duplicated");
    }

    #[test]
    fn reference_example_matches_brute_force() {
        let masses = [14.0, 14.0, 3.0, 12.0];
        let cart = cart_of(&masses);
        let tariff = TariffTable::reference(30.0);

        let result = optimize(&cart, &tariff, 30.0, 10_000, &AlwaysConfirm).unwrap();

        let expected = brute_force_minimum(&masses, &tariff, 30.0);
        assert!((result.total_price - expected).abs() < 1e-9);
        assert!((result.total_price - 25.44).abs() < 1e-9);
        assert_eq!(result.parcel_count(), 2);
        assert_eq!(result.stats.explored, 15);
        assert_complete(&cart, &result);
    }

    #[test]
    fn groups_are_feasible_and_priced_correctly() {
        let masses = [9.5, 7.25, 12.0, 4.0, 18.5, 1.0];
        let cart = cart_of(&masses);
        let tariff = TariffTable::reference(30.0);
        let config = OptimizerConfig::builder().compaction(false).build();

        let result = optimize_with_config(&cart, &tariff, config, &AlwaysConfirm).unwrap();

        let recomputed: f64 = result.groups.iter().map(|g| tariff.price_for(g.mass)).sum();
        assert!((recomputed - result.total_price).abs() < 1e-9);
        for group in &result.groups {
            assert!(group.mass <= 30.0, "group of {} kg", group.mass);
            let member_mass: f64 = group.items.iter().map(|i| i.mass).sum();
            assert!((member_mass - group.mass).abs() < 1e-9);
        }
        let expected = brute_force_minimum(&masses, &tariff, 30.0);
        assert!((result.total_price - expected).abs() < 1e-9);
        assert!((result.total_mass() - cart.total_mass()).abs() < 1e-9);
        assert_complete(&cart, &result);
    }

    #[test]
    fn declined_confirmation_never_searches() {
        let cart = cart_of(&[5.0, 6.0, 7.0, 8.0, 9.0]);
        let tariff = TariffTable::reference(30.0);
        let mut events = Vec::new();
        let config = OptimizerConfig::builder().warning_threshold(10).build();

        let err = optimize_with_progress(&cart, &tariff, config, &NeverConfirm, |e| {
            events.push(e.clone())
        })
        .unwrap_err();

        assert!(matches!(err, OptimizationError::SearchAborted { partitions: 52 }));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, OptimizeEvent::ConfirmationRequested { .. }))
        );
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, OptimizeEvent::SearchStarted { .. }))
        );
        assert!(matches!(
            events.last(),
            Some(OptimizeEvent::Aborted { partitions: 52 })
        ));
    }

    #[test]
    fn small_searches_do_not_ask() {
        let asked = Cell::new(0);
        let confirm = |_: &str| {
            asked.set(asked.get() + 1);
            false
        };
        let cart = cart_of(&[5.0, 6.0, 7.0]);
        let tariff = TariffTable::reference(30.0);

        optimize(&cart, &tariff, 30.0, 10_000, &confirm).unwrap();
        assert_eq!(asked.get(), 0);
    }

    #[test]
    fn empty_cart_costs_nothing() {
        let tariff = TariffTable::reference(30.0);
        let result = optimize(&Cart::new(), &tariff, 30.0, 10_000, &NeverConfirm).unwrap();
        assert_eq!(result.total_price, 0.0);
        assert!(result.groups.is_empty());
    }

    #[test]
    fn oversized_item_is_rejected_before_search() {
        let mut cart = cart_of(&[3.0]);
        cart.push(Item::new("anvil", 31.0).unwrap());
        let tariff = TariffTable::reference(30.0);

        let err = optimize(&cart, &tariff, 30.0, 10_000, &AlwaysConfirm).unwrap_err();
        match err {
            OptimizationError::ExcessiveItemMass { label, mass, .. } => {
                assert_eq!(label, "anvil");
                assert_eq!(mass, 31.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lower_ceiling_is_honoured_by_tariff() {
        let cart = cart_of(&[8.0, 8.0, 3.0]);
        let tariff = TariffTable::reference(10.0);

        let result = optimize(&cart, &tariff, 10.0, 10_000, &AlwaysConfirm).unwrap();
        assert!(result.groups.iter().all(|g| g.mass <= 10.0));
        assert!(result.total_price.is_finite());
        assert_complete(&cart, &result);
    }

    #[test]
    fn many_light_items_are_compacted() {
        let mut cart = Cart::new();
        for i in 0..20 {
            cart.push(Item::new(format!("washer-{}", i % 2), 0.5).unwrap());
        }
        cart.push(Item::new("lamp", 12.0).unwrap());
        let tariff = TariffTable::reference(30.0);
        let mut events = Vec::new();

        let result = optimize_with_progress(
            &cart,
            &tariff,
            OptimizerConfig::default(),
            &AlwaysConfirm,
            |e| events.push(e.clone()),
        )
        .unwrap();

        let summary = result.compaction.as_ref().unwrap();
        assert_eq!(summary.original_items, 21);
        assert_eq!(summary.compacted_items, 5);
        assert_eq!(summary.composite_items, 4);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, OptimizeEvent::CartCompacted { compacted_items: 5, .. }))
        );
        assert!(
            result
                .groups
                .iter()
                .flat_map(|g| g.labels.iter())
                .any(|label| label == "3 x washer-0 + 2 x washer-1")
        );
        assert_complete(&cart, &result);
    }

    #[test]
    fn search_modes_agree_on_price() {
        let masses = [11.0, 2.5, 9.0, 14.0, 6.5, 3.0, 20.0];
        let cart = cart_of(&masses);
        let tariff = TariffTable::reference(30.0);

        let exhaustive = optimize_with_config(
            &cart,
            &tariff,
            OptimizerConfig::builder().compaction(false).build(),
            &AlwaysConfirm,
        )
        .unwrap();
        let pruned = optimize_with_config(
            &cart,
            &tariff,
            OptimizerConfig::builder()
                .compaction(false)
                .search_mode(SearchMode::BranchAndBound)
                .parallel_search(true)
                .build(),
            &AlwaysConfirm,
        )
        .unwrap();

        assert!((exhaustive.total_price - pruned.total_price).abs() < 1e-9);
        assert!(pruned.stats.explored < exhaustive.stats.explored);
        assert_complete(&cart, &pruned);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = OptimizeEvent::Aborted { partitions: 52 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Aborted");
        assert_eq!(json["partitions"], 52);
    }
}
