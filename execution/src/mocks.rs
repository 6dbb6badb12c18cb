//! Helpers for tests that drive the engine.

use crate::{Engine, EngineConfig, MemoryStore, MemoryTransaction, Store, Transaction};
use anyhow::{bail, Result};
use lifland_types::{Player, PlayerId, Tournament, TournamentId, Winner};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Parses a player id, panicking on invalid input.
pub fn pid(id: &str) -> PlayerId {
    PlayerId::new(id).expect("valid player id")
}

/// Parses a tournament id, panicking on invalid input.
pub fn tid(id: &str) -> TournamentId {
    TournamentId::new(id).expect("valid tournament id")
}

pub fn winner(id: &str, prize: u64) -> Winner {
    Winner {
        player_id: pid(id),
        prize,
    }
}

/// Engine over a fresh in-memory store with the default configuration.
pub fn memory_engine() -> Engine<MemoryStore> {
    Engine::new(MemoryStore::new(), EngineConfig::default())
}

/// Funds each `(id, points)` pair, creating the players.
pub fn seed_players<S: Store>(engine: &Engine<S>, players: &[(&str, u64)]) {
    for (id, points) in players {
        engine
            .fund_player(&pid(id), *points)
            .expect("seed player");
    }
}

/// Current balance of `id`, panicking if the player is unknown.
pub fn balance<S: Store>(engine: &Engine<S>, id: &str) -> u64 {
    engine.player(&pid(id)).expect("known player").balance
}

/// Sum of the balances of `ids`.
pub fn total<S: Store>(engine: &Engine<S>, ids: &[&str]) -> u128 {
    ids.iter()
        .map(|id| u128::from(balance(engine, id)))
        .sum()
}

/// Memory store whose commits can be made to fail.
#[derive(Clone, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    fail_commits: Arc<AtomicBool>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

pub struct FaultyTransaction<'a> {
    inner: MemoryTransaction<'a>,
    fail_commit: bool,
}

impl Store for FaultyStore {
    type Tx<'a> = FaultyTransaction<'a>;

    fn begin(&self) -> Result<FaultyTransaction<'_>> {
        Ok(FaultyTransaction {
            inner: self.inner.begin()?,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        })
    }

    fn reset(&self) -> Result<()> {
        self.inner.reset()
    }
}

impl Transaction for FaultyTransaction<'_> {
    fn player(&mut self, id: &PlayerId) -> Result<Option<Player>> {
        self.inner.player(id)
    }

    fn lock_players(&mut self, ids: &BTreeSet<PlayerId>) -> Result<BTreeMap<PlayerId, Player>> {
        self.inner.lock_players(ids)
    }

    fn create_player(&mut self, id: &PlayerId) -> Result<Player> {
        self.inner.create_player(id)
    }

    fn lock_tournament(&mut self, id: &TournamentId) -> Result<Option<Tournament>> {
        self.inner.lock_tournament(id)
    }

    fn put_player(&mut self, player: &Player) -> Result<()> {
        self.inner.put_player(player)
    }

    fn put_tournament(&mut self, tournament: &Tournament) -> Result<()> {
        self.inner.put_tournament(tournament)
    }

    fn delete_tournament(&mut self, id: &TournamentId) -> Result<()> {
        self.inner.delete_tournament(id)
    }

    fn commit(self) -> Result<()> {
        if self.fail_commit {
            self.inner.rollback()?;
            bail!("injected commit failure");
        }
        self.inner.commit()
    }

    fn rollback(self) -> Result<()> {
        self.inner.rollback()
    }
}
