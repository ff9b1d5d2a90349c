//! Parcel consolidation optimizer.
//!
//! Finds the cheapest way to split a cart of items into parcels under a
//! per-parcel price-by-weight tariff. The search is exact and exhaustive,
//! kept tractable by cart compaction and guarded by an operator
//! confirmation for very large searches.

pub mod api;
pub mod compaction;
pub mod config;
pub mod correlate;
pub mod error;
pub mod estimate;
pub mod gate;
pub mod model;
pub mod optimizer;
pub mod partition;
pub mod tariff;

pub use error::OptimizationError;
pub use model::{Cart, Item};
pub use optimizer::{OptimizationResult, OptimizerConfig, optimize};
pub use tariff::TariffTable;
