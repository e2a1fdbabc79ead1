//! Money Module
//!
//! All AFT amounts are non-negative integers in cents. A transfer always moves
//! three independent buckets:
//!
//! - **cashable** - redeemable credits
//! - **restricted** - non-cashable credits, playable only (may carry an expiration)
//! - **nonrestricted** - promotional credits that become cashable once played
//!
//! Display conversion goes through [`format_cents`] so logs and receipts agree.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places of the currency (cents)
pub const CURRENCY_DECIMALS: u32 = 2;

// ============================================================================
// Transfer Amounts
// ============================================================================

/// The three AFT credit buckets, in cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferAmounts {
    pub cashable: u64,
    pub restricted: u64,
    pub nonrestricted: u64,
}

impl TransferAmounts {
    pub const ZERO: TransferAmounts = TransferAmounts {
        cashable: 0,
        restricted: 0,
        nonrestricted: 0,
    };

    pub fn new(cashable: u64, restricted: u64, nonrestricted: u64) -> Self {
        Self {
            cashable,
            restricted,
            nonrestricted,
        }
    }

    /// Sum of all buckets (saturating)
    #[inline]
    pub fn total(&self) -> u64 {
        self.cashable
            .saturating_add(self.restricted)
            .saturating_add(self.nonrestricted)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.cashable == 0 && self.restricted == 0 && self.nonrestricted == 0
    }

    /// Bucket-wise minimum with `available`
    pub fn min_each(&self, available: &TransferAmounts) -> TransferAmounts {
        TransferAmounts {
            cashable: self.cashable.min(available.cashable),
            restricted: self.restricted.min(available.restricted),
            nonrestricted: self.nonrestricted.min(available.nonrestricted),
        }
    }

    /// Bucket-wise saturating addition
    pub fn saturating_add(&self, other: &TransferAmounts) -> TransferAmounts {
        TransferAmounts {
            cashable: self.cashable.saturating_add(other.cashable),
            restricted: self.restricted.saturating_add(other.restricted),
            nonrestricted: self.nonrestricted.saturating_add(other.nonrestricted),
        }
    }

    /// Fit the amounts under `ceiling`, filling cashable first, then restricted,
    /// then nonrestricted. Buckets that do not fit are reduced, never reordered.
    pub fn cap_total(&self, ceiling: u64) -> TransferAmounts {
        let mut room = ceiling;
        let mut take = |wanted: u64| {
            let granted = wanted.min(room);
            room -= granted;
            granted
        };
        TransferAmounts {
            cashable: take(self.cashable),
            restricted: take(self.restricted),
            nonrestricted: take(self.nonrestricted),
        }
    }
}

impl fmt::Display for TransferAmounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cashable={} restricted={} nonrestricted={}",
            format_cents(self.cashable),
            format_cents(self.restricted),
            format_cents(self.nonrestricted)
        )
    }
}

// ============================================================================
// Format: cents -> display
// ============================================================================

/// Convert cents to a currency value
pub fn cents_to_decimal(cents: u64) -> Decimal {
    Decimal::from(cents) / Decimal::from(10u64.pow(CURRENCY_DECIMALS))
}

/// Format cents with two decimal places, e.g. `12345` -> `"123.45"`
pub fn format_cents(cents: u64) -> String {
    format!(
        "{:.prec$}",
        cents_to_decimal(cents),
        prec = CURRENCY_DECIMALS as usize
    )
}
