//! Append-only ledger bookkeeping.
//!
//! Every wallet mutation produces exactly one entry whose `balance_after` and
//! `exposure_after` are the wallet right after the mutation. Entries are
//! ordered by a store-wide `seq`.

use chrono::{DateTime, Utc};
use common::{Page, PageRequest, TransactionFilter, TransactionKind, TransactionMeta};
use rust_decimal::Decimal;
use tracing::error;

use crate::database::{key, new_record_id, DbLedgerEntry, DbUser, LEDGER_TABLE};
use crate::error::{LedgerError, Result};

/// Last sequence number known to be committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequence {
    last: u64,
}

impl Sequence {
    pub fn starting_after(last: u64) -> Self {
        Self { last }
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Numbers handed out by the returned batch only count once the batch is
    /// committed back, so a failed unit of work leaves no gap.
    pub fn postings(&self, now: DateTime<Utc>) -> Postings {
        Postings {
            next: self.last + 1,
            now,
        }
    }

    pub fn commit(&mut self, postings: Postings) {
        self.last = postings.next - 1;
    }
}

#[derive(Debug)]
pub struct Postings {
    next: u64,
    now: DateTime<Utc>,
}

impl Postings {
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Records `amount` against `user`, whose wallet must already reflect it.
    pub fn post(
        &mut self,
        user: &DbUser,
        kind: TransactionKind,
        amount: Decimal,
        meta: TransactionMeta,
    ) -> DbLedgerEntry {
        let seq = self.next;
        self.next += 1;
        DbLedgerEntry {
            id: new_record_id(LEDGER_TABLE),
            seq,
            user_id: user.id.clone(),
            kind,
            amount,
            balance_after: user.wallet.balance,
            exposure_after: user.wallet.exposure,
            meta,
            created_at: self.now,
        }
    }
}

pub fn matches_filter(entry: &DbLedgerEntry, filter: &TransactionFilter) -> bool {
    if let Some(user_id) = &filter.user_id {
        if key(&entry.user_id) != *user_id {
            return false;
        }
    }
    if let Some(kind) = filter.kind {
        if entry.kind != kind {
            return false;
        }
    }
    if let Some(match_id) = &filter.match_id {
        if entry.meta.match_id.as_ref() != Some(match_id) {
            return false;
        }
    }
    true
}

/// Newest first.
pub fn sort_newest_first(entries: &mut [DbLedgerEntry]) {
    entries.sort_by(|a, b| b.seq.cmp(&a.seq));
}

/// Cuts one 1-based page out of `items`, `limit` already resolved.
pub fn paginate<T>(items: Vec<T>, request: PageRequest, limit: u32) -> Page<T> {
    let page = request.page.max(1);
    let total = items.len() as u64;
    let skip = (page as usize - 1).saturating_mul(limit as usize);
    Page {
        items: items.into_iter().skip(skip).take(limit as usize).collect(),
        total,
        page,
        limit,
    }
}

/// Replays `entries` and checks them against the stored wallet: every
/// running sum must match the entry's snapshot, and the final sum must match
/// the balance.
pub fn reconcile(user: &DbUser, entries: &[DbLedgerEntry]) -> Result<()> {
    let mut ordered: Vec<&DbLedgerEntry> = entries.iter().collect();
    ordered.sort_by_key(|entry| entry.seq);

    let mut running = Decimal::ZERO;
    for entry in &ordered {
        running += entry.amount;
        if running != entry.balance_after {
            return Err(inconsistent(format!(
                "user {} entry {} records balance {} but the ledger sums to {}",
                key(&user.id),
                entry.seq,
                entry.balance_after,
                running
            )));
        }
    }

    if running != user.wallet.balance {
        return Err(inconsistent(format!(
            "user {} has balance {} but the ledger sums to {}",
            key(&user.id),
            user.wallet.balance,
            running
        )));
    }

    let exposure = ordered.last().map(|entry| entry.exposure_after).unwrap_or(Decimal::ZERO);
    if exposure != user.wallet.exposure {
        return Err(inconsistent(format!(
            "user {} has exposure {} but the last entry records {}",
            key(&user.id),
            user.wallet.exposure,
            exposure
        )));
    }
    Ok(())
}

fn inconsistent(message: String) -> LedgerError {
    error!("{message}");
    LedgerError::Inconsistency(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Role;
    use rust_decimal_macros::dec;

    fn user() -> DbUser {
        DbUser::new("alice", Role::User, Utc::now())
    }

    #[test]
    fn postings_only_advance_on_commit() {
        let mut sequence = Sequence::starting_after(41);
        let mut user = user();

        let mut abandoned = sequence.postings(Utc::now());
        assert_eq!(abandoned.post(&user, TransactionKind::Deposit, dec!(1), Default::default()).seq, 42);
        assert_eq!(sequence.last(), 41);

        let mut postings = sequence.postings(Utc::now());
        user.wallet.credit(dec!(100));
        let first = postings.post(&user, TransactionKind::Deposit, dec!(100), Default::default());
        user.wallet.debit_for_stake(dec!(40)).unwrap();
        let second = postings.post(&user, TransactionKind::BetStake, dec!(-40), Default::default());
        sequence.commit(postings);

        assert_eq!((first.seq, second.seq), (42, 43));
        assert_eq!(sequence.last(), 43);
        assert_eq!(first.balance_after, dec!(100));
        assert_eq!((second.balance_after, second.exposure_after), (dec!(60), dec!(40)));
    }

    #[test]
    fn reconcile_replays_the_ledger() {
        let mut user = user();
        let mut postings = Sequence::default().postings(Utc::now());

        user.wallet.credit(dec!(100));
        let deposit = postings.post(&user, TransactionKind::Deposit, dec!(100), Default::default());
        user.wallet.debit_for_stake(dec!(40)).unwrap();
        let stake = postings.post(&user, TransactionKind::BetStake, dec!(-40), Default::default());
        user.wallet.release_exposure(dec!(40));
        user.wallet.credit(dec!(79.20));
        let win = postings.post(&user, TransactionKind::BetWin, dec!(79.20), Default::default());

        let entries = vec![win, deposit, stake];
        reconcile(&user, &entries).unwrap();

        // a wallet change without its entry is caught
        user.wallet.credit(dec!(5));
        assert!(matches!(
            reconcile(&user, &entries),
            Err(LedgerError::Inconsistency(_))
        ));
    }

    #[test]
    fn filters_and_pages() {
        let mut user = user();
        let mut postings = Sequence::default().postings(Utc::now());
        let mut entries = Vec::new();
        for i in 1..=5 {
            user.wallet.credit(Decimal::from(i));
            let meta = TransactionMeta {
                match_id: (i % 2 == 0).then(|| "m1".to_string()),
                ..Default::default()
            };
            entries.push(postings.post(&user, TransactionKind::Deposit, Decimal::from(i), meta));
        }

        let filter = TransactionFilter {
            match_id: Some("m1".into()),
            ..Default::default()
        };
        assert_eq!(entries.iter().filter(|e| matches_filter(e, &filter)).count(), 2);

        sort_newest_first(&mut entries);
        let page = paginate(entries, PageRequest::new(2, 2), 2);
        assert_eq!(page.total, 5);
        assert_eq!(page.items.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 2]);
    }
}
