//! Value objects shared across the provisioning domain.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Money amount in the currency's minor unit (cents) to avoid floating point issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money {
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self { cents: 0 }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the dollar portion (whole number).
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.cents.abs() % 100
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }

    /// Returns true if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.cents == 0
    }

    /// Multiplies by a quantity.
    pub fn multiply(&self, quantity: u32) -> Money {
        Money {
            cents: self.cents * quantity as i64,
        }
    }

    /// Splits the amount evenly across `units`, rounding down.
    ///
    /// Returns zero when `units` is zero.
    pub fn per_unit(&self, units: u32) -> Money {
        if units == 0 {
            return Money::zero();
        }
        Money {
            cents: self.cents / units as i64,
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-{}.{:02}", self.dollars().abs(), self.cents_part())
        } else {
            write!(f, "{}.{:02}", self.dollars(), self.cents_part())
        }
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents + rhs.cents,
        }
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.cents += rhs.cents;
    }
}

const KEY_GROUPS: usize = 4;
const KEY_GROUP_LEN: usize = 4;

/// A license activation credential.
///
/// Keys are four groups of four uppercase alphanumeric characters separated
/// by dashes, e.g. `7QK2-M9XA-0ZLP-4TRE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LicenseKey(String);

impl LicenseKey {
    /// Generates a fresh random key.
    ///
    /// Collision checks against stored keys are the caller's responsibility.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let groups: Vec<String> = (0..KEY_GROUPS)
            .map(|_| {
                (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(KEY_GROUP_LEN)
                    .map(|b| (b as char).to_ascii_uppercase())
                    .collect()
            })
            .collect();
        Self(groups.join("-"))
    }

    /// Parses a key, normalizing case and rejecting malformed input.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let normalized = raw.trim().to_ascii_uppercase();
        let groups: Vec<&str> = normalized.split('-').collect();
        let well_formed = groups.len() == KEY_GROUPS
            && groups.iter().all(|g| {
                g.len() == KEY_GROUP_LEN && g.chars().all(|c| c.is_ascii_alphanumeric())
            });

        if !well_formed {
            return Err(DomainError::InvalidLicenseKey(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    /// Wraps a key loaded from storage without re-validating it.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for LicenseKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
