//! Core types for the entitlement engine.

use crate::error::{GateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Authoritative account tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Premium,
}

impl Tier {
    pub fn is_premium(self) -> bool {
        self == Tier::Premium
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }

    /// Parse the persisted form written by [`Tier::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciler view of the tier, including the pre-reconciliation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierState {
    Uninitialized,
    Free,
    Premium,
}

impl TierState {
    /// Effective tier. Nothing is granted before the first reconciliation.
    pub fn tier(self) -> Tier {
        match self {
            TierState::Premium => Tier::Premium,
            TierState::Free | TierState::Uninitialized => Tier::Free,
        }
    }

    pub fn is_initialized(self) -> bool {
        self != TierState::Uninitialized
    }
}

impl From<Tier> for TierState {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Free => TierState::Free,
            Tier::Premium => TierState::Premium,
        }
    }
}

/// Premium-gated capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    UnlimitedLists,
    AllCategories,
    AllUnits,
    LocationReminders,
    UnlimitedNotifications,
    Widgets,
    AppShortcuts,
    Templates,
    BudgetTracking,
    ItemImages,
    ExportImport,
    DataSharing,
    PrioritySupport,
}

impl Feature {
    pub const ALL: [Feature; 13] = [
        Feature::UnlimitedLists,
        Feature::AllCategories,
        Feature::AllUnits,
        Feature::LocationReminders,
        Feature::UnlimitedNotifications,
        Feature::Widgets,
        Feature::AppShortcuts,
        Feature::Templates,
        Feature::BudgetTracking,
        Feature::ItemImages,
        Feature::ExportImport,
        Feature::DataSharing,
        Feature::PrioritySupport,
    ];

    /// Whether the feature is available at `tier`.
    pub fn available_at(self, tier: Tier) -> bool {
        tier.is_premium()
    }
}

/// Item category for shopping-list entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Produce,
    Dairy,
    Bakery,
    Meat,
    Seafood,
    Frozen,
    Pantry,
    Beverages,
    Snacks,
    Household,
    PersonalCare,
    Pets,
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Produce,
        Category::Dairy,
        Category::Bakery,
        Category::Meat,
        Category::Seafood,
        Category::Frozen,
        Category::Pantry,
        Category::Beverages,
        Category::Snacks,
        Category::Household,
        Category::PersonalCare,
        Category::Pets,
        Category::Other,
    ];

    /// Categories available without Premium.
    pub const FREE: [Category; 3] = [Category::Produce, Category::Dairy, Category::Other];
}

/// Measurement unit for shopping-list entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Piece,
    Kilogram,
    Gram,
    Pound,
    Ounce,
    Liter,
    Milliliter,
    Pack,
    Dozen,
    Bottle,
    Can,
    Box,
}

impl Unit {
    pub const ALL: [Unit; 12] = [
        Unit::Piece,
        Unit::Kilogram,
        Unit::Gram,
        Unit::Pound,
        Unit::Ounce,
        Unit::Liter,
        Unit::Milliliter,
        Unit::Pack,
        Unit::Dozen,
        Unit::Bottle,
        Unit::Can,
        Unit::Box,
    ];

    /// Units available without Premium.
    pub const FREE: [Unit; 3] = [Unit::Piece, Unit::Kilogram, Unit::Liter];
}

/// Outcome of a gate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    DeniedNeedsUpgrade,
}

impl Decision {
    pub fn from_bool(allowed: bool) -> Self {
        if allowed {
            Decision::Allowed
        } else {
            Decision::DeniedNeedsUpgrade
        }
    }

    pub fn is_allowed(self) -> bool {
        self == Decision::Allowed
    }
}

/// Numeric cap. `Unbounded` is a sentinel, never a large integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    Capped(u32),
    Unbounded,
}

impl Limit {
    /// Whether one more use is permitted after `used` uses.
    pub fn permits(self, used: u64) -> bool {
        match self {
            Limit::Capped(max) => used < u64::from(max),
            Limit::Unbounded => true,
        }
    }

    /// Uses left after `used`. Saturates at zero.
    pub fn remaining(self, used: u64) -> Limit {
        match self {
            Limit::Capped(max) => {
                let left = u64::from(max).saturating_sub(used);
                Limit::Capped(u32::try_from(left).unwrap_or(max))
            }
            Limit::Unbounded => Limit::Unbounded,
        }
    }

    pub fn is_unbounded(self) -> bool {
        self == Limit::Unbounded
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Capped(n) => write!(f, "{n}"),
            Limit::Unbounded => f.write_str("unlimited"),
        }
    }
}

/// Store product identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        ProductId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProductId({})", self.0)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        ProductId(s.to_string())
    }
}

/// Verification outcome carried by an entitlement event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Verified,
    Expired,
    Refunded,
    Revoked,
}

impl EventKind {
    /// Whether the product is entitled after this event.
    pub fn grants(self) -> bool {
        self == EventKind::Verified
    }
}

/// A verified entitlement change reported by the source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementEvent {
    pub product_id: ProductId,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl EntitlementEvent {
    pub fn new(product_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            product_id: ProductId::new(product_id),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn verified(product_id: impl Into<String>) -> Self {
        Self::new(product_id, EventKind::Verified)
    }

    pub fn revoked(product_id: impl Into<String>) -> Self {
        Self::new(product_id, EventKind::Revoked)
    }

    pub fn expired(product_id: impl Into<String>) -> Self {
        Self::new(product_id, EventKind::Expired)
    }

    /// Decode the JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let event: EntitlementEvent =
            serde_json::from_slice(bytes).map_err(|e| GateError::MalformedEvent(e.to_string()))?;
        if event.product_id.0.trim().is_empty() {
            return Err(GateError::MalformedEvent("empty product id".into()));
        }
        Ok(event)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Kind of date-bucketed usage counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    NotificationsSent,
}

impl CounterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterKind::NotificationsSent => "notifications",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "notifications" => Some(CounterKind::NotificationsSent),
            _ => None,
        }
    }
}
