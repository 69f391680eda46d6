//! Product catalog: the explicit mapping from store product IDs to tiers.
//!
//! Only IDs listed here grant anything. IDs the catalog does not know are
//! ignored by the reconciler.

use crate::types::{ProductId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Billing plan behind a premium product.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumPlan {
    Monthly,
    Yearly,
    Lifetime,
}

/// Known premium products.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCatalog {
    products: BTreeMap<ProductId, PremiumPlan>,
}

impl ProductCatalog {
    pub const MONTHLY: &'static str = "app.shoppinglist.premium.monthly";
    pub const YEARLY: &'static str = "app.shoppinglist.premium.yearly";
    pub const LIFETIME: &'static str = "app.shoppinglist.premium.lifetime";

    /// Catalog with no products; grants nothing.
    pub fn empty() -> Self {
        Self {
            products: BTreeMap::new(),
        }
    }

    pub fn with_product(mut self, id: impl Into<String>, plan: PremiumPlan) -> Self {
        self.products.insert(ProductId::new(id), plan);
        self
    }

    pub fn plan_for(&self, id: &ProductId) -> Option<PremiumPlan> {
        self.products.get(id).copied()
    }

    /// Tier granted while `id` is active, or `None` for unknown products.
    pub fn tier_for(&self, id: &ProductId) -> Option<Tier> {
        self.products.get(id).map(|_| Tier::Premium)
    }

    pub fn contains(&self, id: &ProductId) -> bool {
        self.products.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl Default for ProductCatalog {
    fn default() -> Self {
        Self::empty()
            .with_product(Self::MONTHLY, PremiumPlan::Monthly)
            .with_product(Self::YEARLY, PremiumPlan::Yearly)
            .with_product(Self::LIFETIME, PremiumPlan::Lifetime)
    }
}
