//! Per-user wallet state.
//!
//! `balance` is free money, `exposure` is money locked behind pending bets.
//! Neither ever goes below zero. These methods only do the arithmetic; the
//! store actor pairs every mutation with exactly one ledger entry and commits
//! both in the same transaction.

use common::WalletSnapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wallet {
    pub balance: Decimal,
    pub exposure: Decimal,
}

impl Wallet {
    pub fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            balance: self.balance,
            exposure: self.exposure,
        }
    }

    /// Moves `amount` from balance into exposure, or fails without touching
    /// anything.
    pub fn debit_for_stake(&mut self, amount: Decimal) -> Result<()> {
        self.debit(amount)?;
        self.exposure += amount;
        Ok(())
    }

    pub fn debit(&mut self, amount: Decimal) -> Result<()> {
        if amount > self.balance {
            return Err(LedgerError::InsufficientFunds {
                available: self.balance,
                requested: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    /// Takes as much of `amount` as the balance allows and returns what was
    /// actually taken.
    pub fn debit_up_to(&mut self, amount: Decimal) -> Decimal {
        let taken = amount.min(self.balance).max(Decimal::ZERO);
        self.balance -= taken;
        taken
    }

    pub fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
    }

    pub fn lock_exposure(&mut self, amount: Decimal) {
        self.exposure += amount;
    }

    pub fn release_exposure(&mut self, amount: Decimal) {
        self.exposure = (self.exposure - amount).max(Decimal::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn wallet(balance: Decimal, exposure: Decimal) -> Wallet {
        Wallet { balance, exposure }
    }

    #[test]
    fn stake_moves_balance_into_exposure() {
        let mut w = wallet(dec!(100), dec!(0));
        w.debit_for_stake(dec!(40)).unwrap();
        assert_eq!(w, wallet(dec!(60), dec!(40)));

        // the whole balance may be staked
        w.debit_for_stake(dec!(60)).unwrap();
        assert_eq!(w, wallet(dec!(0), dec!(100)));
    }

    #[test]
    fn insufficient_stake_leaves_wallet_untouched() {
        let mut w = wallet(dec!(50), dec!(10));
        let err = w.debit_for_stake(dec!(60)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { available, requested }
                if available == dec!(50) && requested == dec!(60)
        ));
        assert_eq!(w, wallet(dec!(50), dec!(10)));
    }

    #[test]
    fn exposure_release_is_clamped() {
        let mut w = wallet(dec!(0), dec!(30));
        w.release_exposure(dec!(40));
        assert_eq!(w.exposure, dec!(0));
    }

    #[test]
    fn partial_debit_never_goes_negative() {
        let mut w = wallet(dec!(25), dec!(0));
        assert_eq!(w.debit_up_to(dec!(79.20)), dec!(25));
        assert_eq!(w.balance, dec!(0));
        assert_eq!(w.debit_up_to(dec!(5)), dec!(0));
    }
}
