//! Lifetime AFT meters
//!
//! One triple (plus a transfer count) per category. Updated in the same unit
//! of work as the final transfer record.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::{Persisted, Store, StoreError, UnitOfWork};

use super::types::{TransferAmounts, TransferType};

const METERS_KEY: &str = "aft.meters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterCategory {
    InHouseIn,
    BonusIn,
    DebitIn,
    InHouseOut,
    WinOut,
}

impl MeterCategory {
    pub fn for_transfer(transfer_type: TransferType) -> Self {
        match transfer_type {
            TransferType::InHouseToGamingMachine => MeterCategory::InHouseIn,
            TransferType::BonusCoinOutWinToGamingMachine
            | TransferType::BonusJackpotToGamingMachine => MeterCategory::BonusIn,
            TransferType::DebitToGamingMachine => MeterCategory::DebitIn,
            TransferType::InHouseToHost => MeterCategory::InHouseOut,
            TransferType::WinAmountToHost => MeterCategory::WinOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeterTriple {
    pub amounts: TransferAmounts,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeterSet {
    pub in_house_in: MeterTriple,
    pub bonus_in: MeterTriple,
    pub debit_in: MeterTriple,
    pub in_house_out: MeterTriple,
    pub win_out: MeterTriple,
}

impl MeterSet {
    pub fn get(&self, category: MeterCategory) -> MeterTriple {
        match category {
            MeterCategory::InHouseIn => self.in_house_in,
            MeterCategory::BonusIn => self.bonus_in,
            MeterCategory::DebitIn => self.debit_in,
            MeterCategory::InHouseOut => self.in_house_out,
            MeterCategory::WinOut => self.win_out,
        }
    }

    fn get_mut(&mut self, category: MeterCategory) -> &mut MeterTriple {
        match category {
            MeterCategory::InHouseIn => &mut self.in_house_in,
            MeterCategory::BonusIn => &mut self.bonus_in,
            MeterCategory::DebitIn => &mut self.debit_in,
            MeterCategory::InHouseOut => &mut self.in_house_out,
            MeterCategory::WinOut => &mut self.win_out,
        }
    }
}

pub struct AftMeters {
    persisted: Persisted<MeterSet>,
}

impl AftMeters {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            persisted: Persisted::new(store, METERS_KEY),
        }
    }

    pub fn snapshot(&self) -> Result<MeterSet, StoreError> {
        self.persisted.get()
    }

    /// Stage `amounts` onto `category`
    pub fn accumulate(
        &self,
        category: MeterCategory,
        amounts: &TransferAmounts,
        work: &mut UnitOfWork,
    ) -> Result<MeterSet, StoreError> {
        let mut meters = self.persisted.get()?;
        let triple = meters.get_mut(category);
        triple.amounts = triple.amounts.saturating_add(amounts);
        triple.count += 1;
        self.persisted.save(&meters, Some(work))?;
        Ok(meters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_categories() {
        assert_eq!(
            MeterCategory::for_transfer(TransferType::WinAmountToHost),
            MeterCategory::WinOut
        );
        assert_eq!(
            MeterCategory::for_transfer(TransferType::BonusJackpotToGamingMachine),
            MeterCategory::BonusIn
        );
    }

    #[test]
    fn test_accumulate_in_unit_of_work() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let meters = AftMeters::new(store.clone());

        let mut work = UnitOfWork::new();
        meters
            .accumulate(MeterCategory::InHouseIn, &TransferAmounts::new(500, 20, 0), &mut work)
            .unwrap();
        assert_eq!(meters.snapshot().unwrap(), MeterSet::default());
        store.commit(work).unwrap();

        let mut work = UnitOfWork::new();
        meters
            .accumulate(MeterCategory::InHouseIn, &TransferAmounts::new(100, 0, 5), &mut work)
            .unwrap();
        store.commit(work).unwrap();

        let set = meters.snapshot().unwrap();
        assert_eq!(set.in_house_in.amounts, TransferAmounts::new(600, 20, 5));
        assert_eq!(set.in_house_in.count, 2);
        assert_eq!(set.get(MeterCategory::WinOut), MeterTriple::default());
    }
}
