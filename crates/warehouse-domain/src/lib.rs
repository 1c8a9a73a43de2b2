//! # Sales Warehouse - Domain Model
//!
//! Star-schema entities for the sales warehouse: one fact table of sales
//! lines and two dimension tables (products, customers). These types are the
//! typed source of truth for in-memory row sources handed to the analytics
//! engine.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// =============================================================================
// FACTS
// =============================================================================

/// Sales fact - one transaction line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub order_number: String,
    pub product_key: Option<i64>,
    pub customer_key: Option<i64>,

    // Temporal
    pub order_date: Option<NaiveDate>,
    pub shipping_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,

    // Measures
    pub sales_amount: Option<f64>,
    pub quantity: Option<i64>,
    pub price: Option<f64>,
}

impl FactRow {
    /// Shorthand for a fully populated sales line (shipping and due dates unset)
    pub fn new(
        order_number: &str,
        product_key: i64,
        customer_key: i64,
        order_date: NaiveDate,
        sales_amount: f64,
        quantity: i64,
    ) -> Self {
        let price = if quantity == 0 {
            None
        } else {
            Some(sales_amount / quantity as f64)
        };
        Self {
            order_number: order_number.to_string(),
            product_key: Some(product_key),
            customer_key: Some(customer_key),
            order_date: Some(order_date),
            shipping_date: None,
            due_date: None,
            sales_amount: Some(sales_amount),
            quantity: Some(quantity),
            price,
        }
    }
}

// =============================================================================
// DIMENSIONS
// =============================================================================

/// Product dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDim {
    pub product_key: i64,
    pub product_id: Option<i64>,
    pub product_number: Option<String>,
    pub product_name: Option<String>,

    // Hierarchy
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub product_line: Option<String>,

    pub cost: Option<f64>,
    pub start_date: Option<NaiveDate>,
}

impl ProductDim {
    pub fn new(product_key: i64, name: &str, category: &str, subcategory: &str, cost: f64) -> Self {
        Self {
            product_key,
            product_id: Some(product_key),
            product_number: Some(format!("PRD-{product_key:05}")),
            product_name: Some(name.to_string()),
            category: Some(category.to_string()),
            subcategory: Some(subcategory.to_string()),
            product_line: None,
            cost: Some(cost),
            start_date: None,
        }
    }
}

/// Customer dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerDim {
    pub customer_key: i64,
    pub customer_id: Option<i64>,
    pub customer_number: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,

    // Demographics
    pub country: Option<String>,
    pub marital_status: Option<String>,
    pub gender: Option<String>,
    pub birthdate: Option<NaiveDate>,

    pub create_date: Option<NaiveDate>,
}

impl CustomerDim {
    pub fn new(customer_key: i64, first_name: &str, last_name: &str, birthdate: Option<NaiveDate>) -> Self {
        Self {
            customer_key,
            customer_id: Some(customer_key),
            customer_number: Some(format!("CUS-{customer_key:05}")),
            first_name: Some(first_name.to_string()),
            last_name: Some(last_name.to_string()),
            country: None,
            marital_status: None,
            gender: None,
            birthdate,
            create_date: None,
        }
    }

    /// First and last name joined by a space; a missing part counts as empty
    #[must_use]
    pub fn full_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (None, None) => None,
            (first, last) => Some(format!(
                "{} {}",
                first.as_deref().unwrap_or_default(),
                last.as_deref().unwrap_or_default()
            )),
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Dimension tables must carry unique surrogate keys
pub fn ensure_unique_product_keys(products: &[ProductDim]) -> Result<(), DomainError> {
    ensure_unique("product", products.iter().map(|p| p.product_key))
}

/// Dimension tables must carry unique surrogate keys
pub fn ensure_unique_customer_keys(customers: &[CustomerDim]) -> Result<(), DomainError> {
    ensure_unique("customer", customers.iter().map(|c| c.customer_key))
}

fn ensure_unique(entity_type: &str, keys: impl Iterator<Item = i64>) -> Result<(), DomainError> {
    let mut seen = HashSet::new();
    for key in keys {
        if !seen.insert(key) {
            return Err(DomainError::DuplicateKey {
                entity_type: entity_type.to_string(),
                key,
            });
        }
    }
    Ok(())
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Duplicate {entity_type} key: {key}")]
    DuplicateKey { entity_type: String, key: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::Fake;

    #[test]
    fn test_full_name_handles_missing_parts() {
        let mut customer = CustomerDim::new(1, "Jon", "Yang", None);
        assert_eq!(customer.full_name().as_deref(), Some("Jon Yang"));

        customer.last_name = None;
        assert_eq!(customer.full_name().as_deref(), Some("Jon "));

        customer.first_name = None;
        assert_eq!(customer.full_name(), None);
    }

    #[test]
    fn test_fact_price_derived_from_quantity() {
        let date = NaiveDate::from_ymd_opt(2013, 1, 5).unwrap();
        let fact = FactRow::new("SO1", 1, 1, date, 90.0, 3);
        assert_eq!(fact.price, Some(30.0));

        let zero = FactRow::new("SO2", 1, 1, date, 90.0, 0);
        assert_eq!(zero.price, None);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let key: i64 = (1..10_000).fake();
        let customers = vec![
            CustomerDim::new(key, "A", "B", None),
            CustomerDim::new(key, "C", "D", None),
        ];
        let err = ensure_unique_customer_keys(&customers).unwrap_err();
        assert!(err.to_string().contains(&key.to_string()));

        let products = vec![
            ProductDim::new(1, "Bike", "Bikes", "Road", 500.0),
            ProductDim::new(2, "Helmet", "Accessories", "Helmets", 20.0),
        ];
        assert!(ensure_unique_product_keys(&products).is_ok());
    }
}
