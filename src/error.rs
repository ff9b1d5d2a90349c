use thiserror::Error;

use crate::tariff::TariffError;

/// Everything that can stop a quote from being produced.
///
/// `SearchAborted` is a normal negative outcome (the operator declined a
/// long search), not a failure; use [`OptimizationError::is_cancellation`]
/// to tell it apart. `LabelMismatch` is an internal invariant violation.
#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("invalid tariff: {0}")]
    InvalidTariff(#[from] TariffError),

    #[error("the cart contains no items")]
    EmptyInput,

    #[error(
        "item '{label}' weighs {mass} kg and cannot be shipped alone (maximum parcel mass {max_parcel_mass} kg)"
    )]
    ExcessiveItemMass {
        label: String,
        mass: f64,
        max_parcel_mass: f64,
    },

    #[error(
        "cart cannot be reduced below {limit} candidate partitions without exceeding {max_parcel_mass} kg per parcel ({remaining} items left after {attempts} attempts)"
    )]
    CannotCompact {
        remaining: usize,
        attempts: usize,
        limit: u128,
        max_parcel_mass: f64,
    },

    #[error("search over {partitions} partitions was declined")]
    SearchAborted { partitions: u128 },

    #[error("internal error while restoring item labels: {0}")]
    LabelMismatch(String),
}

impl OptimizationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            OptimizationError::InvalidTariff(_) => "invalid_tariff",
            OptimizationError::EmptyInput => "empty_input",
            OptimizationError::ExcessiveItemMass { .. } => "excessive_item_mass",
            OptimizationError::CannotCompact { .. } => "cannot_compact",
            OptimizationError::SearchAborted { .. } => "search_aborted",
            OptimizationError::LabelMismatch(_) => "label_mismatch",
        }
    }

    /// The operator declined to run the search.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, OptimizationError::SearchAborted { .. })
    }

    /// An internal defect rather than bad input or a cancellation.
    pub fn is_defect(&self) -> bool {
        matches!(self, OptimizationError::LabelMismatch(_))
    }
}
