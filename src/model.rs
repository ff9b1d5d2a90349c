//! Data models for the parcel consolidation optimizer.
//!
//! This module defines the fundamental input structures:
//! - `Item`: a labelled article with a mass
//! - `Cart`: the ordered list of articles to ship
//!
//! Items are immutable once placed in a cart. The optimizer sorts internally,
//! so cart order only matters for display.

use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

/// Validation error for item data.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid mass: {0}")]
    InvalidMass(String),
    #[error("Invalid label: {0}")]
    InvalidLabel(String),
}

/// Helper function to validate a mass value.
///
/// Zero is legal (degenerate but harmless), negative and non-finite values are not.
fn validate_mass(value: f64, label: &str) -> Result<(), ValidationError> {
    if value.is_nan() || value.is_infinite() || value < 0.0 {
        return Err(ValidationError::InvalidMass(format!(
            "mass of '{}' must be a non-negative finite number, got: {}",
            label, value
        )));
    }
    Ok(())
}

/// A single article to ship.
///
/// # Fields
/// * `id` - Label of the article (reference, name or free text)
/// * `mass` - Mass of the article in kg
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "id": "screws-m6", "mass": 1.5 }))]
pub struct Item {
    pub id: String,
    pub mass: f64,
}

impl Item {
    /// Creates a new item with validation.
    ///
    /// # Examples
    /// ```
    /// use parcel_optimizer::model::Item;
    ///
    /// assert!(Item::new("lamp", 2.5).is_ok());
    /// assert!(Item::new("lamp", -1.0).is_err());
    /// ```
    pub fn new(id: impl Into<String>, mass: f64) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::InvalidLabel(
                "item label must not be empty".to_string(),
            ));
        }
        validate_mass(mass, &id)?;
        Ok(Self { id, mass })
    }
}

/// Ordered sequence of items handed to the optimizer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cart {
    items: Vec<Item>,
}

impl Cart {
    /// Creates an empty cart.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates every item and builds the cart.
    pub fn from_items(items: Vec<Item>) -> Result<Self, ValidationError> {
        items
            .into_iter()
            .map(|item| Item::new(item.id, item.mass))
            .collect::<Result<Vec<_>, _>>()
            .map(|items| Self { items })
    }

    /// Adds a validated item to the end of the cart.
    pub fn push(&mut self, item: Item) {
        self.items.push(item);
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of all item masses, in cart order.
    pub fn total_mass(&self) -> f64 {
        self.items.iter().map(|item| item.mass).sum()
    }

    /// Returns the heaviest item, if any.
    pub fn heaviest(&self) -> Option<&Item> {
        self.items
            .iter()
            .max_by(|a, b| a.mass.total_cmp(&b.mass))
    }
}

impl FromIterator<Item> for Cart {
    fn from_iter<T: IntoIterator<Item = Item>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}
