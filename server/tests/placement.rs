//! Bet placement against a live engine.

mod support;

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use common::{
    BetStatus, ErrorKind, MatchStatus, NewMatch, PageRequest, TransactionFilter, TransactionKind,
};
use rust_decimal_macros::dec;
use tokio::task::JoinSet;

use server::LedgerError;
use support::{harness, upcoming};

// =============================================================================
// HAPPY PATH
// =============================================================================

#[tokio::test]
async fn stake_moves_into_exposure() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let fixture = h.open_match().await;

    let (bet, wallet) = h
        .engine
        .place_bet(&alice, &fixture.id, "IND", "40")
        .await
        .unwrap();

    assert_eq!(wallet.balance, dec!(60));
    assert_eq!(wallet.exposure, dec!(40));
    assert_eq!(bet.potential_win, dec!(79.20));
    assert_eq!(bet.side, "india");
    assert_eq!(bet.status, BetStatus::Pending);
    assert_eq!(bet.user_id, alice.user_id);

    let stakes = h
        .engine
        .transactions(
            &alice,
            TransactionFilter {
                kind: Some(TransactionKind::BetStake),
                ..Default::default()
            },
            PageRequest::default(),
        )
        .await
        .unwrap();
    assert_eq!(stakes.total, 1);
    let entry = &stakes.items[0];
    assert_eq!(entry.amount, dec!(-40));
    assert_eq!(entry.balance_after, dec!(60));
    assert_eq!(entry.exposure_after, dec!(40));
    assert_eq!(entry.meta.bet_id.as_deref(), Some(bet.id.as_str()));
    assert_eq!(entry.meta.match_id.as_deref(), Some(fixture.id.as_str()));

    h.engine.audit_wallet(&h.admin, &alice.user_id).await.unwrap();
    h.tasks.shutdown().await;
}

#[tokio::test]
async fn custom_odds_are_used() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let mut input = upcoming("Chennai vs Mumbai");
    input.odds = Some(BTreeMap::from([
        ("CHE".to_string(), dec!(1.5)),
        ("mumbai".to_string(), dec!(2.35)),
    ]));
    let fixture = h.match_with(input).await;

    let (bet, _) = h.engine.place_bet(&alice, &fixture.id, "chennai", "10").await.unwrap();
    assert_eq!(bet.potential_win, dec!(15.00));
    let (bet, _) = h.engine.place_bet(&alice, &fixture.id, "MUM", "10.55").await.unwrap();
    assert_eq!(bet.potential_win, dec!(24.79));
}

// =============================================================================
// REJECTIONS
// =============================================================================

#[tokio::test]
async fn stake_below_minimum_leaves_no_trace() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let mut input = upcoming("India vs Australia");
    input.min_bet = Some(dec!(10));
    let fixture = h.match_with(input).await;

    let err = h
        .engine
        .place_bet(&alice, &fixture.id, "IND", "5")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::StakeOutOfRange { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let wallet = h.engine.wallet(&alice).await.unwrap();
    assert_eq!((wallet.balance, wallet.exposure), (dec!(100), dec!(0)));
    let ledger = h
        .engine
        .transactions(&alice, TransactionFilter::default(), PageRequest::default())
        .await
        .unwrap();
    assert_eq!(ledger.total, 1, "only the deposit");
    assert!(h.engine.my_bets(&alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn each_failure_has_its_own_error() {
    let h = harness().await;
    let alice = h.user("alice", dec!(30)).await;
    let fixture = h.open_match().await;

    let err = h.engine.place_bet(&alice, &fixture.id, "IND", "ten").await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidStake(_)));

    let err = h.engine.place_bet(&alice, "nope", "IND", "10").await.unwrap_err();
    assert!(matches!(err, LedgerError::MatchNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h.engine.place_bet(&alice, &fixture.id, "england", "10").await.unwrap_err();
    assert!(err.to_string().contains("INDIA (IND) or AUSTRALIA (AUS)"));

    let err = h.engine.place_bet(&alice, &fixture.id, "IND", "31").await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert_eq!(err.kind(), ErrorKind::Funds);

    h.engine.set_user_blocked(&h.admin, &alice.user_id, true).await.unwrap();
    let err = h.engine.place_bet(&alice, &fixture.id, "IND", "10").await.unwrap_err();
    assert!(matches!(err, LedgerError::UserBlocked(_)));

    h.engine.set_user_blocked(&h.admin, &alice.user_id, false).await.unwrap();
    h.engine.place_bet(&alice, &fixture.id, "IND", "10").await.unwrap();
}

#[tokio::test]
async fn betting_closes_at_the_cutoff() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let now = Utc::now();
    let fixture = h
        .match_with(NewMatch::new(
            "India vs Australia",
            now + Duration::hours(1),
            now - Duration::minutes(1),
        ))
        .await;

    let read = h.engine.get_match(&fixture.id).await.unwrap();
    assert_eq!(read.status, MatchStatus::Locked);

    let err = h.engine.place_bet(&alice, &fixture.id, "IND", "10").await.unwrap_err();
    assert!(matches!(err, LedgerError::BettingClosed { .. }));
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let locked = h.engine.list_matches(Some(MatchStatus::Locked)).await.unwrap();
    assert_eq!(locked.len(), 1);
}

#[tokio::test]
async fn admin_status_changes_gate_betting() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let fixture = h.open_match().await;

    h.engine.set_match_status(&h.admin, &fixture.id, MatchStatus::Live).await.unwrap();
    h.engine.place_bet(&alice, &fixture.id, "AUS", "10").await.unwrap();

    h.engine.set_match_status(&h.admin, &fixture.id, MatchStatus::Locked).await.unwrap();
    assert!(h.engine.place_bet(&alice, &fixture.id, "AUS", "10").await.is_err());

    let err = h
        .engine
        .set_match_status(&h.admin, &fixture.id, MatchStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransition { .. }));

    let err = h
        .engine
        .set_match_status(&alice, &fixture.id, MatchStatus::Live)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

// =============================================================================
// CONCURRENCY
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_concurrent_stakes_cannot_both_spend_the_balance() {
    let h = harness().await;
    let alice = h.user("alice", dec!(100)).await;
    let fixture = h.open_match().await;

    let mut set = JoinSet::new();
    for _ in 0..2 {
        let engine = h.engine.clone();
        let alice = alice.clone();
        let match_id = fixture.id.clone();
        set.spawn(async move { engine.place_bet(&alice, &match_id, "IND", "60").await });
    }

    let mut placed = 0;
    let mut refused = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(_) => placed += 1,
            Err(LedgerError::InsufficientFunds { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((placed, refused), (1, 1));

    let wallet = h.engine.wallet(&alice).await.unwrap();
    assert_eq!((wallet.balance, wallet.exposure), (dec!(40), dec!(60)));
    h.engine.audit_wallet(&h.admin, &alice.user_id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn n_concurrent_stakes_leave_exactly_one_refused() {
    const N: u32 = 8;
    let h = harness().await;
    let alice = h.user("alice", dec!(25) * rust_decimal::Decimal::from(N - 1)).await;
    let fixture = h.open_match().await;

    let mut set = JoinSet::new();
    for _ in 0..N {
        let engine = h.engine.clone();
        let alice = alice.clone();
        let match_id = fixture.id.clone();
        set.spawn(async move { engine.place_bet(&alice, &match_id, "AUS", "25").await });
    }

    let mut placed = 0;
    let mut refused = 0;
    while let Some(result) = set.join_next().await {
        match result.unwrap() {
            Ok(_) => placed += 1,
            Err(LedgerError::InsufficientFunds { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(placed, N - 1);
    assert_eq!(refused, 1);

    let wallet = h.engine.wallet(&alice).await.unwrap();
    assert_eq!(wallet.balance, dec!(0));
    assert_eq!(wallet.exposure, dec!(175));
    assert_eq!(h.engine.my_bets(&alice).await.unwrap().len(), (N - 1) as usize);
    h.engine.audit_wallet(&h.admin, &alice.user_id).await.unwrap();
}
