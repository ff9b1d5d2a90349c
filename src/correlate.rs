//! Maps search results back to the cart units they came from.

use tracing::error;

use crate::compaction::CartUnit;
use crate::error::OptimizationError;
use crate::partition::SearchItem;

/// Tracks which cart units have already been attached to a parcel.
///
/// Every unit must be claimed exactly once; anything else is an internal
/// defect and surfaces as [`OptimizationError::LabelMismatch`].
pub struct LabelCorrelator<'a> {
    units: &'a [CartUnit],
    claimed: Vec<bool>,
}

impl<'a> LabelCorrelator<'a> {
    pub fn new(units: &'a [CartUnit]) -> Self {
        Self {
            units,
            claimed: vec![false; units.len()],
        }
    }

    /// Search items for every unit, tagged with their position.
    pub fn search_items(units: &[CartUnit]) -> Vec<SearchItem> {
        units
            .iter()
            .enumerate()
            .map(|(index, unit)| SearchItem {
                index,
                mass: unit.mass,
            })
            .collect()
    }

    /// Claims the unit behind `item`.
    pub fn claim(&mut self, item: SearchItem) -> Result<&'a CartUnit, OptimizationError> {
        let units = self.units;
        let Some(unit) = units.get(item.index) else {
            return Err(mismatch(format!(
                "search returned unknown item #{} ({} kg)",
                item.index, item.mass
            )));
        };
        if unit.mass.to_bits() != item.mass.to_bits() {
            return Err(mismatch(format!(
                "item #{} ('{}') weighs {} kg but the search reported {} kg",
                item.index, unit.label, unit.mass, item.mass
            )));
        }
        if std::mem::replace(&mut self.claimed[item.index], true) {
            return Err(mismatch(format!(
                "item #{} ('{}') was placed in more than one parcel",
                item.index, unit.label
            )));
        }
        Ok(unit)
    }

    /// Claims all members of one group, in order.
    pub fn claim_group(
        &mut self,
        group: &[SearchItem],
    ) -> Result<Vec<&'a CartUnit>, OptimizationError> {
        group.iter().map(|item| self.claim(*item)).collect()
    }

    /// Fails if any unit was never claimed.
    pub fn finish(self) -> Result<(), OptimizationError> {
        match self.claimed.iter().position(|claimed| !claimed) {
            Some(index) => Err(mismatch(format!(
                "item #{index} ('{}') is missing from the result",
                self.units[index].label
            ))),
            None => Ok(()),
        }
    }
}

fn mismatch(detail: String) -> OptimizationError {
    error!(%detail, "label correlation failed");
    OptimizationError::LabelMismatch(detail)
}
