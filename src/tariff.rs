//! Tariff model for the per-parcel carrier.
//!
//! A tariff is a right-continuous step function: the price of a parcel of
//! mass `m` is the price of the first bracket whose threshold is `>= m`.
//! Masses above the top bracket are clamped to the last price.
//!
//! Brackets above the carrier's maximum parcel mass are priced at
//! `f64::INFINITY` at construction time, independently of the feasibility
//! check performed by the partition search.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Reference tariff of the parcel carrier (kg, EUR).
const REFERENCE_TARIFF: [(f64, f64); 30] = [
    (1.0, 7.27),
    (2.0, 7.39),
    (3.0, 7.51),
    (4.0, 7.63),
    (5.0, 7.76),
    (6.0, 8.00),
    (7.0, 8.23),
    (8.0, 8.48),
    (9.0, 8.71),
    (10.0, 8.97),
    (11.0, 10.30),
    (12.0, 10.30),
    (13.0, 10.30),
    (14.0, 10.30),
    (15.0, 10.30),
    (16.0, 11.51),
    (17.0, 11.51),
    (18.0, 11.51),
    (19.0, 11.51),
    (20.0, 11.51),
    (21.0, 13.93),
    (22.0, 13.93),
    (23.0, 13.93),
    (24.0, 13.93),
    (25.0, 13.93),
    (26.0, 15.14),
    (27.0, 15.14),
    (28.0, 15.14),
    (29.0, 15.14),
    (30.0, 15.14),
];

/// Number of header lines at the top of a tariff file.
const CSV_HEADER_LINES: usize = 2;

/// Errors raised while building a tariff table.
#[derive(Debug, Error)]
pub enum TariffError {
    #[error("tariff has {thresholds} thresholds but {prices} prices")]
    LengthMismatch { thresholds: usize, prices: usize },
    #[error("tariff has no brackets")]
    Empty,
    #[error(
        "tariff thresholds must be strictly increasing (bracket {index}: {current} after {previous})"
    )]
    NotIncreasing {
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("tariff bracket {index} contains an invalid value: {value}")]
    InvalidValue { index: usize, value: f64 },
    #[error("tariff line {line} could not be parsed: '{content}'")]
    Parse { line: usize, content: String },
    #[error("tariff file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One step of the tariff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, ToSchema)]
pub struct TariffEntry {
    pub threshold_mass: f64,
    /// `None` in JSON when the bracket lies above the maximum parcel mass.
    #[serde(serialize_with = "serialize_price")]
    #[schema(value_type = Option<f64>)]
    pub unit_price: f64,
}

fn serialize_price<S: serde::Serializer>(price: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if price.is_finite() {
        serializer.serialize_some(price)
    } else {
        serializer.serialize_none()
    }
}

/// Raw tariff data as loaded from configuration, before the per-request
/// maximum parcel mass is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct TariffRates {
    thresholds: Vec<f64>,
    prices: Vec<f64>,
}

impl TariffRates {
    pub fn new(thresholds: Vec<f64>, prices: Vec<f64>) -> Self {
        Self { thresholds, prices }
    }

    /// Built-in reference tariff, 1 to 30 kg.
    pub fn reference() -> Self {
        let (thresholds, prices) = REFERENCE_TARIFF.iter().copied().unzip();
        Self { thresholds, prices }
    }

    /// Parses the carrier tariff file format.
    ///
    /// The first two lines are headers; every following non-blank line is
    /// `mass,price`.
    pub fn from_csv_str(text: &str) -> Result<Self, TariffError> {
        let mut thresholds = Vec::new();
        let mut prices = Vec::new();

        for (idx, raw_line) in text.lines().enumerate().skip(CSV_HEADER_LINES) {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let parse_error = || TariffError::Parse {
                line: idx + 1,
                content: raw_line.to_string(),
            };
            let (mass, price) = line.split_once(',').ok_or_else(parse_error)?;
            let mass = mass.trim().parse::<f64>().map_err(|_| parse_error())?;
            let price = price.trim().parse::<f64>().map_err(|_| parse_error())?;
            thresholds.push(mass);
            prices.push(price);
        }

        Ok(Self { thresholds, prices })
    }

    /// Reads a tariff file from disk.
    pub fn from_csv_file(path: &Path) -> Result<Self, TariffError> {
        let text = fs::read_to_string(path).map_err(|source| TariffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_csv_str(&text)
    }

    /// Builds the validated table for one calculation.
    pub fn table(&self, max_parcel_mass: f64) -> Result<TariffTable, TariffError> {
        TariffTable::new(&self.thresholds, &self.prices, max_parcel_mass)
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }
}

/// Immutable, sorted price-by-mass step function.
#[derive(Clone, Debug, PartialEq)]
pub struct TariffTable {
    entries: Vec<TariffEntry>,
    max_parcel_mass: f64,
}

impl TariffTable {
    /// Builds a table from parallel threshold/price sequences.
    ///
    /// Thresholds must be strictly increasing. Any threshold above
    /// `max_parcel_mass` gets its price forced to `+infinity`.
    pub fn new(
        thresholds: &[f64],
        prices: &[f64],
        max_parcel_mass: f64,
    ) -> Result<Self, TariffError> {
        if thresholds.len() != prices.len() {
            return Err(TariffError::LengthMismatch {
                thresholds: thresholds.len(),
                prices: prices.len(),
            });
        }
        if thresholds.is_empty() {
            return Err(TariffError::Empty);
        }

        let mut entries = Vec::with_capacity(thresholds.len());
        for (index, (&threshold_mass, &price)) in thresholds.iter().zip(prices).enumerate() {
            if !threshold_mass.is_finite() {
                return Err(TariffError::InvalidValue {
                    index,
                    value: threshold_mass,
                });
            }
            if price.is_nan() || price < 0.0 {
                return Err(TariffError::InvalidValue { index, value: price });
            }
            if let Some(previous) = entries.last().map(|e: &TariffEntry| e.threshold_mass) {
                if threshold_mass <= previous {
                    return Err(TariffError::NotIncreasing {
                        index,
                        previous,
                        current: threshold_mass,
                    });
                }
            }

            let unit_price = if threshold_mass > max_parcel_mass {
                f64::INFINITY
            } else {
                price
            };
            entries.push(TariffEntry {
                threshold_mass,
                unit_price,
            });
        }

        Ok(Self {
            entries,
            max_parcel_mass,
        })
    }

    /// Reference tariff with the given ceiling applied.
    pub fn reference(max_parcel_mass: f64) -> Self {
        match TariffRates::reference().table(max_parcel_mass) {
            Ok(table) => table,
            Err(err) => unreachable!("reference tariff is well-formed: {err}"),
        }
    }

    /// Parses a tariff file and applies the ceiling.
    pub fn from_csv_str(text: &str, max_parcel_mass: f64) -> Result<Self, TariffError> {
        TariffRates::from_csv_str(text)?.table(max_parcel_mass)
    }

    /// Price of a parcel of the given mass.
    ///
    /// Ceiling search: the first bracket with `threshold_mass >= mass` wins;
    /// above the last bracket the last price applies.
    pub fn price_for(&self, mass: f64) -> f64 {
        let idx = self
            .entries
            .partition_point(|entry| entry.threshold_mass < mass);
        match self.entries.get(idx).or_else(|| self.entries.last()) {
            Some(entry) => entry.unit_price,
            None => f64::INFINITY,
        }
    }

    /// Returns `true` if prices never decrease as mass grows.
    pub fn is_non_decreasing(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].unit_price <= pair[1].unit_price)
    }

    pub fn entries(&self) -> &[TariffEntry] {
        &self.entries
    }

    pub fn max_parcel_mass(&self) -> f64 {
        self.max_parcel_mass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> TariffTable {
        TariffTable::new(&[10.0, 20.0], &[5.0, 8.0], 30.0).unwrap()
    }

    #[test]
    fn step_semantics_use_ceiling_bracket() {
        let table = two_step();
        assert_eq!(table.price_for(5.0), 5.0);
        assert_eq!(table.price_for(10.0), 5.0);
        assert_eq!(table.price_for(10.01), 8.0);
        assert_eq!(table.price_for(20.0), 8.0);
    }

    #[test]
    fn masses_above_top_bracket_are_clamped() {
        let table = two_step();
        assert_eq!(table.price_for(25.0), 8.0);
        assert_eq!(table.price_for(1000.0), 8.0);
    }

    #[test]
    fn zero_mass_uses_first_bracket() {
        assert_eq!(two_step().price_for(0.0), 5.0);
    }

    #[test]
    fn brackets_above_max_mass_cost_infinity() {
        let table = TariffTable::new(&[10.0, 20.0, 40.0], &[5.0, 8.0, 12.0], 30.0).unwrap();
        assert_eq!(table.price_for(15.0), 8.0);
        assert!(table.price_for(35.0).is_infinite());
        // clamped above the top bracket, which is itself infeasible
        assert!(table.price_for(50.0).is_infinite());
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let err = TariffTable::new(&[1.0, 2.0], &[1.0], 30.0).unwrap_err();
        assert!(matches!(
            err,
            TariffError::LengthMismatch {
                thresholds: 2,
                prices: 1
            }
        ));
    }

    #[test]
    fn rejects_non_increasing_thresholds() {
        let err = TariffTable::new(&[1.0, 3.0, 3.0], &[1.0, 2.0, 3.0], 30.0).unwrap_err();
        assert!(matches!(err, TariffError::NotIncreasing { index: 2, .. }));

        let err = TariffTable::new(&[5.0, 2.0], &[1.0, 2.0], 30.0).unwrap_err();
        assert!(matches!(err, TariffError::NotIncreasing { index: 1, .. }));
    }

    #[test]
    fn rejects_empty_and_invalid_values() {
        assert!(matches!(
            TariffTable::new(&[], &[], 30.0),
            Err(TariffError::Empty)
        ));
        assert!(matches!(
            TariffTable::new(&[1.0], &[f64::NAN], 30.0),
            Err(TariffError::InvalidValue { index: 0, .. })
        ));
        assert!(matches!(
            TariffTable::new(&[f64::INFINITY], &[1.0], 30.0),
            Err(TariffError::InvalidValue { index: 0, .. })
        ));
    }

    #[test]
    fn reference_tariff_is_flat_within_bands() {
        let table = TariffTable::reference(30.0);
        assert_eq!(table.entries().len(), 30);
        assert_eq!(table.price_for(1.0), 7.27);
        assert_eq!(table.price_for(11.0), table.price_for(15.0));
        assert_eq!(table.price_for(26.0), 15.14);
        assert_eq!(table.price_for(30.0), 15.14);
        assert!(table.is_non_decreasing());
    }

    #[test]
    fn reference_tariff_respects_lower_max_mass() {
        let table = TariffTable::reference(29.0);
        assert_eq!(table.price_for(29.0), 15.14);
        assert!(table.price_for(29.5).is_infinite());
    }

    #[test]
    fn parses_csv_with_headers() {
        let text = "DPD tarifs 2025\nkg,price\n1,7.27\n2, 7.39\n\n3 ,7.51\n";
        let table = TariffTable::from_csv_str(text, 30.0).unwrap();
        assert_eq!(table.entries().len(), 3);
        assert_eq!(table.price_for(2.5), 7.51);
    }

    #[test]
    fn csv_reports_line_of_malformed_row() {
        let text = "header\nkg,price\n1,7.27\n2;7.39\n";
        let err = TariffTable::from_csv_str(text, 30.0).unwrap_err();
        assert!(matches!(err, TariffError::Parse { line: 4, .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = TariffRates::from_csv_file(Path::new("/nonexistent/tariff.csv")).unwrap_err();
        assert!(matches!(err, TariffError::Io { .. }));
    }

    #[test]
    fn rates_build_tables_per_ceiling() {
        let rates = TariffRates::reference();
        assert_eq!(rates.len(), 30);
        let strict = rates.table(20.0).unwrap();
        let loose = rates.table(30.0).unwrap();
        assert!(strict.price_for(25.0).is_infinite());
        assert_eq!(loose.price_for(25.0), 13.93);
    }

    #[test]
    fn detects_decreasing_prices() {
        let table = TariffTable::new(&[1.0, 2.0], &[5.0, 4.0], 30.0).unwrap();
        assert!(!table.is_non_decreasing());
    }

    #[test]
    fn infinite_price_serializes_as_null() {
        let entry = TariffEntry {
            threshold_mass: 40.0,
            unit_price: f64::INFINITY,
        };
        let json = serde_json::to_value(entry).unwrap();
        assert!(json["unit_price"].is_null());
    }
}
