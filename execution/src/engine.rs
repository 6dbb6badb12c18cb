use anyhow::Context as _;
use lifland_types::{
    api::{JoinReceipt, PlayerBalance, SettlementReceipt},
    PlayerId, Tournament, TournamentId, Winner,
};
use std::collections::BTreeSet;

use crate::{
    ledger::{credit, debit, Snapshot},
    settlement::pay_out,
    sponsorship::sponsor,
    store::{Store, Transaction},
    EngineError,
};

pub const DEFAULT_FUND_CREATES_PLAYER: bool = true;
pub const DEFAULT_MAX_LOCK_ATTEMPTS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Whether funding an unknown player creates it.
    pub fund_creates_player: bool,
    /// Upper bound on settlement attempts while the lock set keeps growing.
    pub max_lock_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fund_creates_player: DEFAULT_FUND_CREATES_PLAYER,
            max_lock_attempts: DEFAULT_MAX_LOCK_ATTEMPTS,
        }
    }
}

/// Outcome of one settlement attempt.
enum Attempt<T> {
    Done(T),
    /// A winner's obligations reach outside the locked rows.
    Widen(BTreeSet<PlayerId>),
}

/// Runs every ledger operation inside one store transaction.
pub struct Engine<S: Store> {
    store: S,
    config: EngineConfig,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `f` in a fresh transaction, committing on success and rolling
    /// back on error.
    fn in_transaction<'s, T>(
        &'s self,
        operation: &'static str,
        f: impl FnOnce(&mut S::Tx<'s>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut tx = self.store.begin().context("begin transaction")?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit().context("commit transaction")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(operation, ?rollback, "rollback failed");
                }
                tracing::debug!(operation, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    pub fn fund_player(&self, id: &PlayerId, amount: u64) -> Result<PlayerBalance, EngineError> {
        let balance = self.in_transaction("fund", |tx| {
            let mut rows = tx.lock_players(&BTreeSet::from([id.clone()]))?;
            if !rows.contains_key(id) {
                if !self.config.fund_creates_player {
                    return Err(EngineError::NoSuchPlayer(id.clone()));
                }
                rows.insert(id.clone(), tx.create_player(id)?);
            }
            let mut snapshot = Snapshot::new(rows);
            credit(snapshot.get_mut(id)?, amount)?;
            persist(tx, &snapshot)?;
            Ok(PlayerBalance::from(snapshot.get(id)?))
        })?;
        tracing::info!(player = %id, amount, balance = balance.balance, "player funded");
        Ok(balance)
    }

    pub fn take_player(&self, id: &PlayerId, amount: u64) -> Result<PlayerBalance, EngineError> {
        let balance = self.in_transaction("take", |tx| {
            let mut snapshot = Snapshot::new(tx.lock_players(&BTreeSet::from([id.clone()]))?);
            debit(snapshot.get_mut(id)?, amount)?;
            persist(tx, &snapshot)?;
            Ok(PlayerBalance::from(snapshot.get(id)?))
        })?;
        tracing::info!(player = %id, amount, balance = balance.balance, "points taken");
        Ok(balance)
    }

    /// Opens (or re-opens with an empty player set) a tournament.
    pub fn announce_tournament(&self, id: &TournamentId, deposit: u64) -> Result<(), EngineError> {
        if deposit == 0 {
            return Err(EngineError::InvalidDeposit);
        }
        let previous = self.in_transaction("announce", |tx| {
            let previous = tx.lock_tournament(id)?;
            tx.put_tournament(&Tournament::new(id.clone(), deposit))?;
            Ok(previous)
        })?;
        match previous {
            Some(previous) if !previous.players.is_empty() => tracing::warn!(
                tournament = %id,
                deposit,
                dropped_players = previous.players.len(),
                "tournament re-announced; registered players discarded"
            ),
            _ => tracing::info!(tournament = %id, deposit, "tournament announced"),
        }
        Ok(())
    }

    pub fn join_tournament(
        &self,
        tournament_id: &TournamentId,
        player_id: &PlayerId,
        backers: &[PlayerId],
    ) -> Result<JoinReceipt, EngineError> {
        let receipt = self.in_transaction("join", |tx| {
            let mut tournament = tx
                .lock_tournament(tournament_id)?
                .ok_or_else(|| EngineError::NoSuchTournament(tournament_id.clone()))?;
            if tournament.is_registered(player_id) {
                return Err(EngineError::AlreadyRegistered {
                    player: player_id.clone(),
                    tournament: tournament_id.clone(),
                });
            }

            let ids: BTreeSet<PlayerId> = std::iter::once(player_id)
                .chain(backers)
                .cloned()
                .collect();
            let mut snapshot = Snapshot::new(tx.lock_players(&ids)?);
            let deposit = tournament.deposit;
            let sponsorship = if snapshot.get(player_id)?.points >= deposit {
                None
            } else {
                Some(sponsor(&mut snapshot, player_id, deposit, backers)?)
            };
            debit(snapshot.get_mut(player_id)?, deposit)?;
            tournament.players.insert(player_id.clone());

            persist(tx, &snapshot)?;
            tx.put_tournament(&tournament)?;
            Ok(JoinReceipt {
                tournament_id: tournament_id.clone(),
                player_id: player_id.clone(),
                deposit,
                sponsorship,
            })
        })?;
        tracing::info!(
            tournament = %tournament_id,
            player = %player_id,
            deposit = receipt.deposit,
            backers = receipt.sponsorship.as_ref().map_or(0, |s| s.backers),
            share = receipt.sponsorship.as_ref().map_or(0, |s| s.share),
            "player joined tournament"
        );
        Ok(receipt)
    }

    /// Pays out a tournament and deletes it.
    ///
    /// The rows to lock depend on the winners' backer sets, which are only
    /// trustworthy once locked. Each attempt plans the set from an unlocked
    /// read, locks it in id order, then checks that nothing outside the set is
    /// owed. If something is, the attempt is rolled back and retried with the
    /// larger set.
    pub fn result_tournament(
        &self,
        tournament_id: &TournamentId,
        winners: &[Winner],
    ) -> Result<SettlementReceipt, EngineError> {
        let mut lock_set: BTreeSet<PlayerId> =
            winners.iter().map(|w| w.player_id.clone()).collect();
        for attempt in 1..=self.config.max_lock_attempts {
            let mut tx = self.store.begin().context("begin transaction")?;
            match settle(&mut tx, tournament_id, winners, &lock_set) {
                Ok(Attempt::Done(receipt)) => {
                    tx.commit().context("commit transaction")?;
                    tracing::info!(
                        tournament = %tournament_id,
                        winners = receipt.payouts.len(),
                        attempt,
                        "tournament settled"
                    );
                    return Ok(receipt);
                }
                Ok(Attempt::Widen(wider)) => {
                    tx.rollback().context("rollback transaction")?;
                    tracing::debug!(
                        tournament = %tournament_id,
                        attempt,
                        rows = wider.len(),
                        "widening settlement lock set"
                    );
                    lock_set = wider;
                }
                Err(err) => {
                    if let Err(rollback) = tx.rollback() {
                        tracing::warn!(operation = "result", ?rollback, "rollback failed");
                    }
                    tracing::debug!(tournament = %tournament_id, error = %err, "settlement rejected");
                    return Err(err);
                }
            }
        }
        tracing::warn!(
            tournament = %tournament_id,
            attempts = self.config.max_lock_attempts,
            "settlement lock set did not stabilise"
        );
        Err(EngineError::Storage(anyhow::anyhow!(
            "settlement lock set did not stabilise after {} attempts",
            self.config.max_lock_attempts
        )))
    }

    pub fn player(&self, id: &PlayerId) -> Result<PlayerBalance, EngineError> {
        self.in_transaction("balance", |tx| {
            tx.player(id)?
                .map(|player| PlayerBalance::from(&player))
                .ok_or_else(|| EngineError::NoSuchPlayer(id.clone()))
        })
    }

    /// Deletes every player and tournament.
    pub fn reset(&self) -> Result<(), EngineError> {
        self.store.reset().context("reset store")?;
        tracing::warn!("ledger reset");
        Ok(())
    }
}

fn persist<T: Transaction>(tx: &mut T, snapshot: &Snapshot) -> Result<(), EngineError> {
    for player in snapshot.dirty() {
        tx.put_player(player)?;
    }
    Ok(())
}

fn settle<T: Transaction>(
    tx: &mut T,
    tournament_id: &TournamentId,
    winners: &[Winner],
    lock_set: &BTreeSet<PlayerId>,
) -> Result<Attempt<SettlementReceipt>, EngineError> {
    let tournament = tx
        .lock_tournament(tournament_id)?
        .ok_or_else(|| EngineError::NoSuchTournament(tournament_id.clone()))?;
    for winner in winners {
        if !tournament.is_registered(&winner.player_id) {
            return Err(EngineError::PlayerNotRegistered {
                player: winner.player_id.clone(),
                tournament: tournament_id.clone(),
            });
        }
    }

    let mut planned = lock_set.clone();
    for winner in winners {
        if let Some(player) = tx.player(&winner.player_id)? {
            planned.extend(player.backers);
        }
    }

    let rows = tx.lock_players(&planned)?;
    let missing: BTreeSet<PlayerId> = winners
        .iter()
        .filter_map(|w| rows.get(&w.player_id))
        .flat_map(|player| player.backers.iter())
        .filter(|backer| !planned.contains(*backer))
        .cloned()
        .collect();
    if !missing.is_empty() {
        planned.extend(missing);
        return Ok(Attempt::Widen(planned));
    }

    let mut snapshot = Snapshot::new(rows);
    let payouts = winners
        .iter()
        .map(|winner| pay_out(&mut snapshot, winner))
        .collect::<Result<Vec<_>, _>>()?;
    persist(tx, &snapshot)?;
    tx.delete_tournament(tournament_id)?;
    Ok(Attempt::Done(SettlementReceipt {
        tournament_id: tournament_id.clone(),
        payouts,
    }))
}
