//! AFT Core Types
//!
//! Wire-level codes carry their SAS byte values so a protocol layer can map
//! them one-to-one.

use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::money::TransferAmounts;

/// Longest host transaction id accepted
pub const MAX_TRANSACTION_ID_LEN: usize = 20;

// ============================================================================
// Transfer Type / Code
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferType {
    /// Host -> machine, in-house account
    #[default]
    InHouseToGamingMachine = 0x00,
    /// Host -> machine, bonus paid as coin-out win
    BonusCoinOutWinToGamingMachine = 0x10,
    /// Host -> machine, bonus paid as jackpot
    BonusJackpotToGamingMachine = 0x11,
    /// Host -> machine, debit card
    DebitToGamingMachine = 0x40,
    /// Machine -> host, in-house account
    InHouseToHost = 0x80,
    /// Machine -> host, win amount only
    WinAmountToHost = 0x90,
}

impl TransferType {
    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(TransferType::InHouseToGamingMachine),
            0x10 => Some(TransferType::BonusCoinOutWinToGamingMachine),
            0x11 => Some(TransferType::BonusJackpotToGamingMachine),
            0x40 => Some(TransferType::DebitToGamingMachine),
            0x80 => Some(TransferType::InHouseToHost),
            0x90 => Some(TransferType::WinAmountToHost),
            _ => None,
        }
    }

    #[inline]
    pub fn is_transfer_off(&self) -> bool {
        matches!(self, TransferType::InHouseToHost | TransferType::WinAmountToHost)
    }

    #[inline]
    pub fn is_bonus(&self) -> bool {
        matches!(
            self,
            TransferType::BonusCoinOutWinToGamingMachine | TransferType::BonusJackpotToGamingMachine
        )
    }

    #[inline]
    pub fn is_debit(&self) -> bool {
        matches!(self, TransferType::DebitToGamingMachine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferCode {
    #[default]
    FullOnly = 0x00,
    PartialAllowed = 0x01,
    CancelRequest = 0x80,
    Interrogation = 0xFF,
}

impl TransferCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(TransferCode::FullOnly),
            0x01 => Some(TransferCode::PartialAllowed),
            0x80 => Some(TransferCode::CancelRequest),
            0xFF => Some(TransferCode::Interrogation),
            _ => None,
        }
    }
}

// ============================================================================
// Transfer Status
// ============================================================================

/// Host-visible transfer status. `>= 0x80` is a failure, `0x40` is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferStatus {
    FullTransferSuccessful = 0x00,
    PartialTransferSuccessful = 0x01,
    TransferPending = 0x40,
    CanceledByHost = 0x80,
    TransactionIdNotUnique = 0x81,
    NotValidTransferFunction = 0x82,
    NotValidTransferAmountOrExpirationDate = 0x83,
    TransferAmountExceedsGameLimit = 0x84,
    TransferAmountNotEvenMultiple = 0x85,
    GamingMachineUnableToPerformPartial = 0x86,
    GamingMachineUnableToPerformTransfer = 0x87,
    GamingMachineNotRegistered = 0x88,
    RegistrationKeyDoesNotMatch = 0x89,
    NoPosId = 0x8A,
    NoWonCreditsAvailableForCashOut = 0x8B,
    NoDenominationSet = 0x8C,
    ExpirationNotValidForTransferToTicket = 0x8D,
    TransferToTicketDeviceNotAvailable = 0x8E,
    UnableToAcceptTransferDueToExistingRestrictedAmounts = 0x8F,
    UnableToPrintTransactionReceipt = 0x90,
    InsufficientDataToPrintTransactionReceipt = 0x91,
    TransactionReceiptNotAllowedForTransferType = 0x92,
    AssetNumberZeroOrDoesNotMatch = 0x93,
    GamingMachineNotLocked = 0x94,
    TransactionIdNotValid = 0x95,
    UnexpectedError = 0x9F,
    NotCompatibleWithCurrentTransfer = 0xC0,
    UnsupportedTransferCode = 0xC1,
    #[default]
    NoTransferInfoAvailable = 0xFF,
}

impl TransferStatus {
    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TransferStatus::FullTransferSuccessful | TransferStatus::PartialTransferSuccessful
        )
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, TransferStatus::TransferPending)
    }

    /// Failure codes, excluding the "nothing to report" sentinel
    #[inline]
    pub fn is_failure(&self) -> bool {
        self.code() >= 0x80 && *self != TransferStatus::NoTransferInfoAvailable
    }

    /// Completed one way or the other
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:02X})", self, self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReceiptStatus {
    ReceiptPrinted = 0x00,
    ReceiptPrintingInProgress = 0x20,
    ReceiptPending = 0x40,
    #[default]
    NoReceiptRequested = 0xFF,
}

// ============================================================================
// Flags
// ============================================================================

/// AFT transfer flags bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AftFlags(pub u8);

impl AftFlags {
    pub const NONE: AftFlags = AftFlags(0);
    pub const HOST_CASHOUT_ENABLE_CONTROL: AftFlags = AftFlags(0x01);
    pub const HOST_CASHOUT_ENABLE: AftFlags = AftFlags(0x02);
    pub const HOST_CASHOUT_MODE_HARD: AftFlags = AftFlags(0x04);
    pub const CASHOUT_FROM_GAMING_MACHINE: AftFlags = AftFlags(0x08);
    pub const ACCEPT_TRANSFER_ONLY_IF_LOCKED: AftFlags = AftFlags(0x40);
    pub const TRANSACTION_RECEIPT_REQUEST: AftFlags = AftFlags(0x80);

    /// Bits owned by the host cash-out settings
    pub const HOST_CASHOUT_MASK: AftFlags = AftFlags(0x07);

    #[inline]
    pub fn contains(&self, other: AftFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(&self, other: AftFlags) -> AftFlags {
        AftFlags(self.0 | other.0)
    }

    #[inline]
    pub fn intersection(&self, other: AftFlags) -> AftFlags {
        AftFlags(self.0 & other.0)
    }

    #[inline]
    pub fn host_cashout_bits(&self) -> AftFlags {
        self.intersection(AftFlags::HOST_CASHOUT_MASK)
    }
}

impl std::ops::BitOr for AftFlags {
    type Output = AftFlags;

    fn bitor(self, rhs: AftFlags) -> AftFlags {
        self.union(rhs)
    }
}

/// Conditions a host attaches to a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferConditions(pub u8);

impl TransferConditions {
    pub const NONE: TransferConditions = TransferConditions(0);
    pub const TRANSFER_TO_GAMING_MACHINE_OK: TransferConditions = TransferConditions(0x01);
    pub const TRANSFER_FROM_GAMING_MACHINE_OK: TransferConditions = TransferConditions(0x02);
    pub const BONUS_AWARD_TO_GAMING_MACHINE_OK: TransferConditions = TransferConditions(0x08);

    #[inline]
    pub fn contains(&self, other: TransferConditions) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bonus_award_ok(&self) -> bool {
        self.contains(TransferConditions::BONUS_AWARD_TO_GAMING_MACHINE_OK)
    }
}

// ============================================================================
// Host Exceptions
// ============================================================================

/// General exceptions the AFT subsystem raises towards the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostException {
    AftTransferComplete = 0x69,
    AftRequestForHostCashOut = 0x6A,
    AftRequestForHostToCashOutWin = 0x6B,
    AftRequestToRegister = 0x6C,
    AftRegistrationAcknowledged = 0x6D,
    AftRegistrationCanceled = 0x6E,
    GameLocked = 0x6F,
}

impl HostException {
    #[inline]
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

// ============================================================================
// Restricted Expiration
// ============================================================================

/// Expiration carried with restricted credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestrictedExpiration {
    #[default]
    None,
    /// Expires this many days after the transfer
    Days(u16),
    /// Expires on a calendar date
    Date(NaiveDate),
}

impl RestrictedExpiration {
    /// Resolve to a calendar date relative to `today`
    pub fn resolve(&self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            RestrictedExpiration::None => None,
            RestrictedExpiration::Days(days) => {
                today.checked_add_days(chrono::Days::new(u64::from(*days)))
            }
            RestrictedExpiration::Date(date) => Some(*date),
        }
    }

    /// Keep whichever expiration lasts longer; "none" never wins over a real one
    pub fn higher_priority(
        self,
        other: RestrictedExpiration,
        today: NaiveDate,
    ) -> RestrictedExpiration {
        match (self.resolve(today), other.resolve(today)) {
            (None, _) => other,
            (_, None) => self,
            (Some(a), Some(b)) if b > a => other,
            _ => self,
        }
    }

    /// SAS BCD-style MMDDYYYY value, or 0000NNNN for day counts
    pub fn to_wire(&self) -> u32 {
        match self {
            RestrictedExpiration::None => 0,
            RestrictedExpiration::Days(days) => u32::from(*days),
            RestrictedExpiration::Date(date) => {
                date.month() * 1_000_000 + date.day() * 10_000 + date.year().max(0) as u32
            }
        }
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

// ============================================================================
// Transfer Data
// ============================================================================

/// Optional receipt details supplied by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptData {
    pub transfer_source: String,
    pub patron_name: String,
    pub patron_account: String,
    pub debit_card_number: String,
}

/// AFT transfer request, and its response once processed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferData {
    pub transaction_id: String,
    pub transfer_code: TransferCode,
    pub transfer_type: TransferType,
    pub asset_number: u32,
    pub registration_key: [u8; 20],
    pub requested: TransferAmounts,
    pub transferred: TransferAmounts,
    pub flags: AftFlags,
    pub status: TransferStatus,
    pub receipt_status: ReceiptStatus,
    pub expiration: RestrictedExpiration,
    pub pool_id: u16,
    pub receipt: ReceiptData,
    pub transaction_date: Option<chrono::DateTime<Utc>>,
}

impl TransferData {
    pub fn new(
        transaction_id: impl Into<String>,
        transfer_type: TransferType,
        transfer_code: TransferCode,
        requested: TransferAmounts,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            transfer_type,
            transfer_code,
            requested,
            ..Self::default()
        }
    }

    #[inline]
    pub fn partial_allowed(&self) -> bool {
        self.transfer_code == TransferCode::PartialAllowed
    }

    #[inline]
    pub fn receipt_requested(&self) -> bool {
        self.flags.contains(AftFlags::TRANSACTION_RECEIPT_REQUEST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(TransferStatus::FullTransferSuccessful.is_success());
        assert!(TransferStatus::TransferPending.is_pending());
        assert!(TransferStatus::GamingMachineUnableToPerformTransfer.is_failure());
        assert!(!TransferStatus::NoTransferInfoAvailable.is_failure());
        assert!(!TransferStatus::TransferPending.is_terminal());
        assert!(TransferStatus::CanceledByHost.is_terminal());
    }

    #[test]
    fn test_transfer_type_codes() {
        for t in [
            TransferType::InHouseToGamingMachine,
            TransferType::BonusCoinOutWinToGamingMachine,
            TransferType::BonusJackpotToGamingMachine,
            TransferType::DebitToGamingMachine,
            TransferType::InHouseToHost,
            TransferType::WinAmountToHost,
        ] {
            assert_eq!(TransferType::from_code(t.code()), Some(t));
        }
        assert!(TransferType::from_code(0x20).is_none());
        assert!(TransferType::WinAmountToHost.is_transfer_off());
        assert!(TransferType::BonusJackpotToGamingMachine.is_bonus());
    }

    #[test]
    fn test_flags() {
        let flags = AftFlags::HOST_CASHOUT_ENABLE_CONTROL
            | AftFlags::HOST_CASHOUT_ENABLE
            | AftFlags::TRANSACTION_RECEIPT_REQUEST;
        assert!(flags.contains(AftFlags::HOST_CASHOUT_ENABLE));
        assert!(!flags.contains(AftFlags::HOST_CASHOUT_MODE_HARD));
        assert_eq!(flags.host_cashout_bits(), AftFlags(0x03));
    }

    #[test]
    fn test_expiration_priority() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let days = RestrictedExpiration::Days(30);
        let date = RestrictedExpiration::Date(NaiveDate::from_ymd_opt(2026, 1, 20).unwrap());

        assert_eq!(days.higher_priority(date, today), days);
        assert_eq!(date.higher_priority(days, today), days);
        assert_eq!(RestrictedExpiration::None.higher_priority(date, today), date);
        assert_eq!(date.higher_priority(RestrictedExpiration::None, today), date);
        assert_eq!(
            RestrictedExpiration::Date(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap()).to_wire(),
            3_04_2026
        );
    }
}
