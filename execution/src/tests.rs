//! End-to-end engine behaviour over the memory store.

use crate::mocks::{balance, memory_engine, pid, seed_players, tid, total, winner, FaultyStore};
use crate::{Engine, EngineConfig, EngineError, ErrorKind, MemoryStore};
use lifland_types::api::Sponsorship;

#[test]
fn scenario_a_sponsored_join() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 50), ("bob", 200)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();

    let receipt = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob")])
        .unwrap();
    assert_eq!(receipt.deposit, 100);
    assert_eq!(
        receipt.sponsorship,
        Some(Sponsorship {
            share: 50,
            backers: 1,
            remainder: 0
        })
    );
    assert_eq!(balance(&engine, "alice"), 0);
    assert_eq!(balance(&engine, "bob"), 150);
}

#[test]
fn scenario_b_settlement_repays_backer() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 50), ("bob", 200)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob")])
        .unwrap();

    let receipt = engine
        .result_tournament(&tid("t1"), &[winner("alice", 200)])
        .unwrap();
    assert_eq!(receipt.payouts.len(), 1);
    assert_eq!(receipt.payouts[0].backer_share, 100);
    assert_eq!(receipt.payouts[0].repaid, vec![pid("bob")]);
    assert_eq!(balance(&engine, "alice"), 100);
    assert_eq!(balance(&engine, "bob"), 250);
    assert_eq!(engine.store().tournament_count(), 0);

    // Obligation is gone: a second win is not shared.
    engine.announce_tournament(&tid("t2"), 100).unwrap();
    engine.join_tournament(&tid("t2"), &pid("alice"), &[]).unwrap();
    engine
        .result_tournament(&tid("t2"), &[winner("alice", 50)])
        .unwrap();
    assert_eq!(balance(&engine, "alice"), 50);
    assert_eq!(balance(&engine, "bob"), 250);
}

#[test]
fn scenario_c_no_backers() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 50)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();

    let err = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[])
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFundsNoBackers { .. }));
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(balance(&engine, "alice"), 50);

    // Not registered either.
    let err = engine
        .result_tournament(&tid("t1"), &[winner("alice", 1)])
        .unwrap_err();
    assert!(matches!(err, EngineError::PlayerNotRegistered { .. }));
}

#[test]
fn rich_player_ignores_backers() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 150), ("bob", 200)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    let receipt = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob")])
        .unwrap();
    assert!(receipt.sponsorship.is_none());
    assert_eq!(balance(&engine, "alice"), 50);
    assert_eq!(balance(&engine, "bob"), 200);

    // No obligation was recorded.
    engine
        .result_tournament(&tid("t1"), &[winner("alice", 100)])
        .unwrap();
    assert_eq!(balance(&engine, "alice"), 150);
    assert_eq!(balance(&engine, "bob"), 200);
}

#[test]
fn join_conservation_with_truncation() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 40), ("bob", 100), ("carol", 100)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    let before = total(&engine, &["alice", "bob", "carol"]);

    let receipt = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob"), pid("carol")])
        .unwrap();
    let sponsorship = receipt.sponsorship.unwrap();
    let (share, remainder) = (sponsorship.share, sponsorship.remainder);
    assert_eq!(share, 33);
    assert_eq!(remainder, 1);

    // The participants lose exactly the deposit.
    assert_eq!(total(&engine, &["alice", "bob", "carol"]), before - 100);
    // Backers pay one share each, the player pays a share plus the remainder.
    assert_eq!(balance(&engine, "bob"), 100 - share);
    assert_eq!(balance(&engine, "carol"), 100 - share);
    assert_eq!(balance(&engine, "alice"), 40 - (share + remainder));
}

#[test]
fn failing_backer_rolls_back_everything() {
    let engine = memory_engine();
    seed_players(
        &engine,
        &[("alice", 0), ("bob", 100), ("carol", 10), ("dave", 100)],
    );
    engine.announce_tournament(&tid("t1"), 90).unwrap();

    let err = engine
        .join_tournament(
            &tid("t1"),
            &pid("alice"),
            &[pid("bob"), pid("carol"), pid("dave")],
        )
        .unwrap_err();
    assert!(
        matches!(&err, EngineError::BackerInsufficientFunds { backer, .. } if *backer == pid("carol"))
    );
    assert_eq!(balance(&engine, "alice"), 0);
    assert_eq!(balance(&engine, "bob"), 100);
    assert_eq!(balance(&engine, "carol"), 10);
    assert_eq!(balance(&engine, "dave"), 100);

    // Nobody is owed anything and alice is not registered.
    let err = engine
        .result_tournament(&tid("t1"), &[winner("alice", 10)])
        .unwrap_err();
    assert!(matches!(err, EngineError::PlayerNotRegistered { .. }));
}

#[test]
fn sponsorship_short_of_deposit_rolls_back() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 0), ("bob", 100)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();

    // bob covers 50, alice cannot pay the rest.
    let err = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob")])
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientFunds { balance: 50, required: 100, .. }
    ));
    assert_eq!(balance(&engine, "alice"), 0);
    assert_eq!(balance(&engine, "bob"), 100);
}

#[test]
fn obligations_survive_across_tournaments() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 50), ("bob", 200)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine.announce_tournament(&tid("t2"), 100).unwrap();
    engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob")])
        .unwrap();
    engine.fund_player(&pid("alice"), 100).unwrap();
    engine.join_tournament(&tid("t2"), &pid("alice"), &[]).unwrap();
    assert_eq!(balance(&engine, "alice"), 0);
    assert_eq!(balance(&engine, "bob"), 150);

    // t1 pays nobody; the obligation stays with alice.
    let receipt = engine.result_tournament(&tid("t1"), &[]).unwrap();
    assert!(receipt.payouts.is_empty());

    // t2's prize repays bob for the t1 sponsorship.
    let receipt = engine
        .result_tournament(&tid("t2"), &[winner("alice", 300)])
        .unwrap();
    assert_eq!(receipt.payouts[0].backer_share, 150);
    assert_eq!(balance(&engine, "alice"), 150);
    assert_eq!(balance(&engine, "bob"), 300);
}

#[test]
fn resulting_twice_fails() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 100)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine.join_tournament(&tid("t1"), &pid("alice"), &[]).unwrap();
    engine
        .result_tournament(&tid("t1"), &[winner("alice", 10)])
        .unwrap();

    let err = engine
        .result_tournament(&tid("t1"), &[winner("alice", 10)])
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchTournament(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(balance(&engine, "alice"), 10);
}

#[test]
fn unregistered_winner_aborts_whole_settlement() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 100), ("bob", 100)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine.join_tournament(&tid("t1"), &pid("alice"), &[]).unwrap();

    let err = engine
        .result_tournament(&tid("t1"), &[winner("alice", 500), winner("bob", 500)])
        .unwrap_err();
    assert!(matches!(err, EngineError::PlayerNotRegistered { player, .. } if player == pid("bob")));
    assert_eq!(balance(&engine, "alice"), 0);
    assert_eq!(balance(&engine, "bob"), 100);

    // The tournament is still open.
    engine
        .result_tournament(&tid("t1"), &[winner("alice", 500)])
        .unwrap();
    assert_eq!(balance(&engine, "alice"), 500);
}

#[test]
fn shared_backer_is_repaid_by_each_winner() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 0), ("carol", 0), ("bob", 1_000)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob"), pid("bob")])
        .unwrap_err();
    engine.fund_player(&pid("alice"), 34).unwrap();
    engine.fund_player(&pid("carol"), 34).unwrap();
    engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("bob"), pid("bob")])
        .unwrap();
    engine
        .join_tournament(&tid("t1"), &pid("carol"), &[pid("bob"), pid("bob")])
        .unwrap();
    assert_eq!(balance(&engine, "bob"), 1_000 - 4 * 33);

    // One entry per backer in the set: each winner repays bob once.
    let receipt = engine
        .result_tournament(&tid("t1"), &[winner("alice", 90), winner("carol", 90)])
        .unwrap();
    for payout in &receipt.payouts {
        assert_eq!(payout.backer_share, 45);
        assert_eq!(payout.repaid, vec![pid("bob")]);
    }
    assert_eq!(balance(&engine, "alice"), 45);
    assert_eq!(balance(&engine, "carol"), 45);
    assert_eq!(balance(&engine, "bob"), 1_000 - 4 * 33 + 90);
}

#[test]
fn self_backing_nets_to_zero() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 80)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    let err = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("alice")])
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    assert_eq!(balance(&engine, "alice"), 80);
}

#[test]
fn duplicate_registration_is_rejected() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 300)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine.join_tournament(&tid("t1"), &pid("alice"), &[]).unwrap();

    let err = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[])
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyRegistered { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(balance(&engine, "alice"), 200);
}

#[test]
fn missing_rows_are_not_found() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 0)]);

    let err = engine
        .join_tournament(&tid("nope"), &pid("alice"), &[])
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchTournament(_)));

    engine.announce_tournament(&tid("t1"), 100).unwrap();
    let err = engine
        .join_tournament(&tid("t1"), &pid("ghost"), &[])
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchPlayer(id) if id == pid("ghost")));

    let err = engine
        .join_tournament(&tid("t1"), &pid("alice"), &[pid("ghost")])
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchPlayer(id) if id == pid("ghost")));

    assert!(matches!(
        engine.take_player(&pid("ghost"), 1),
        Err(EngineError::NoSuchPlayer(_))
    ));
    assert!(matches!(
        engine.player(&pid("ghost")),
        Err(EngineError::NoSuchPlayer(_))
    ));
}

#[test]
fn fund_and_take() {
    let engine = memory_engine();
    let funded = engine.fund_player(&pid("alice"), 30).unwrap();
    assert_eq!(funded.balance, 30);
    assert_eq!(engine.fund_player(&pid("alice"), 20).unwrap().balance, 50);
    assert_eq!(engine.take_player(&pid("alice"), 50).unwrap().balance, 0);

    let err = engine.take_player(&pid("alice"), 1).unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    assert_eq!(balance(&engine, "alice"), 0);
}

#[test]
fn fund_can_require_existing_player() {
    let engine = Engine::new(
        MemoryStore::new(),
        EngineConfig {
            fund_creates_player: false,
            ..EngineConfig::default()
        },
    );
    let err = engine.fund_player(&pid("alice"), 10).unwrap_err();
    assert!(matches!(err, EngineError::NoSuchPlayer(_)));
    assert_eq!(engine.store().player_count(), 0);
}

#[test]
fn credit_overflow_is_a_conflict() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", u64::MAX)]);
    let err = engine.fund_player(&pid("alice"), 1).unwrap_err();
    assert!(matches!(err, EngineError::BalanceOverflow { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(balance(&engine, "alice"), u64::MAX);
}

#[test]
fn announce_validates_and_reopens() {
    let engine = memory_engine();
    let err = engine.announce_tournament(&tid("t1"), 0).unwrap_err();
    assert!(matches!(err, EngineError::InvalidDeposit));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.store().tournament_count(), 0);

    seed_players(&engine, &[("alice", 100)]);
    engine.announce_tournament(&tid("t1"), 100).unwrap();
    engine.join_tournament(&tid("t1"), &pid("alice"), &[]).unwrap();

    // Re-announcing drops the registrations; the deposit is not refunded.
    engine.announce_tournament(&tid("t1"), 10).unwrap();
    let err = engine
        .result_tournament(&tid("t1"), &[winner("alice", 1)])
        .unwrap_err();
    assert!(matches!(err, EngineError::PlayerNotRegistered { .. }));
    assert_eq!(balance(&engine, "alice"), 0);
}

#[test]
fn reset_empties_the_ledger() {
    let engine = memory_engine();
    seed_players(&engine, &[("alice", 100)]);
    engine.announce_tournament(&tid("t1"), 10).unwrap();
    engine.reset().unwrap();
    assert!(matches!(
        engine.player(&pid("alice")),
        Err(EngineError::NoSuchPlayer(_))
    ));
    assert_eq!(engine.store().tournament_count(), 0);
}

#[test]
fn commit_failure_is_storage_and_leaves_state() {
    let store = FaultyStore::new();
    let engine = Engine::new(store.clone(), EngineConfig::default());
    seed_players(&engine, &[("alice", 10)]);

    store.fail_commits(true);
    let err = engine.fund_player(&pid("alice"), 5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    store.fail_commits(false);
    assert_eq!(balance(&engine, "alice"), 10);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    const PLAYERS: usize = 4;
    const TOURNAMENTS: usize = 2;

    #[derive(Clone, Debug)]
    enum Op {
        Fund(usize, u64),
        Take(usize, u64),
        Announce(usize, u64),
        Join(usize, usize, Vec<usize>),
        Result(usize, Vec<(usize, u64)>),
    }

    fn player(index: usize) -> String {
        format!("p{index}")
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..PLAYERS, 0..200u64).prop_map(|(p, a)| Op::Fund(p, a)),
            (0..PLAYERS, 0..200u64).prop_map(|(p, a)| Op::Take(p, a)),
            (0..TOURNAMENTS, 1..150u64).prop_map(|(t, d)| Op::Announce(t, d)),
            (
                0..TOURNAMENTS,
                0..PLAYERS,
                prop::collection::vec(0..PLAYERS, 0..3)
            )
                .prop_map(|(t, p, b)| Op::Join(t, p, b)),
            (
                0..TOURNAMENTS,
                prop::collection::vec((0..PLAYERS, 0..300u64), 0..3)
            )
                .prop_map(|(t, w)| Op::Result(t, w)),
        ]
    }

    proptest! {
        #[test]
        fn ledger_conserves_points(ops in prop::collection::vec(arb_op(), 1..60)) {
            let engine = memory_engine();
            // Points that should exist across all players.
            let mut expected: u128 = 0;

            for op in ops {
                match op {
                    Op::Fund(p, amount) => {
                        if engine.fund_player(&pid(&player(p)), amount).is_ok() {
                            expected += u128::from(amount);
                        }
                    }
                    Op::Take(p, amount) => {
                        if engine.take_player(&pid(&player(p)), amount).is_ok() {
                            expected -= u128::from(amount);
                        }
                    }
                    Op::Announce(t, deposit) => {
                        engine.announce_tournament(&tid(&format!("t{t}")), deposit).unwrap();
                    }
                    Op::Join(t, p, backers) => {
                        let backers: Vec<_> = backers.into_iter().map(|b| pid(&player(b))).collect();
                        if let Ok(receipt) =
                            engine.join_tournament(&tid(&format!("t{t}")), &pid(&player(p)), &backers)
                        {
                            expected -= u128::from(receipt.deposit);
                        }
                    }
                    Op::Result(t, winners) => {
                        let winners: Vec<_> = winners
                            .into_iter()
                            .map(|(p, prize)| winner(&player(p), prize))
                            .collect();
                        if engine.result_tournament(&tid(&format!("t{t}")), &winners).is_ok() {
                            expected += winners.iter().map(|w| u128::from(w.prize)).sum::<u128>();
                        }
                    }
                }

                let actual: u128 = (0..PLAYERS)
                    .filter_map(|p| engine.player(&pid(&player(p))).ok())
                    .map(|b| u128::from(b.balance))
                    .sum();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
