//! Transactional row store used by the engine.
//!
//! A [Store] hands out [Transaction]s. Every row a transaction intends to
//! modify must be locked first; locks are held until commit or rollback and
//! writes become visible atomically at commit. Callers acquire locks in one
//! global order (the tournament row, then player rows in ascending id order)
//! so concurrent transactions cannot deadlock.
//!
//! Dropping a transaction that was neither committed nor rolled back rolls it
//! back.

use anyhow::Result;
use lifland_types::{Player, PlayerId, Tournament, TournamentId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub trait Transaction {
    /// Reads a player without locking it (own pending writes are visible).
    fn player(&mut self, id: &PlayerId) -> Result<Option<Player>>;

    /// Locks every listed player row and returns the ones that exist.
    ///
    /// Rows are locked in ascending id order. Missing ids are absent from the
    /// returned map, but stay reserved until the transaction ends.
    fn lock_players(&mut self, ids: &BTreeSet<PlayerId>) -> Result<BTreeMap<PlayerId, Player>>;

    /// Inserts an empty row for `id` unless one exists, and returns the row
    /// locked. Concurrent creators of the same id see a single row.
    fn create_player(&mut self, id: &PlayerId) -> Result<Player>;

    /// Locks a tournament row and returns it if it exists.
    fn lock_tournament(&mut self, id: &TournamentId) -> Result<Option<Tournament>>;

    fn put_player(&mut self, player: &Player) -> Result<()>;
    fn put_tournament(&mut self, tournament: &Tournament) -> Result<()>;
    fn delete_tournament(&mut self, id: &TournamentId) -> Result<()>;

    fn commit(self) -> Result<()>;
    fn rollback(self) -> Result<()>;
}

pub trait Store: Send + Sync {
    type Tx<'a>: Transaction
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Tx<'_>>;

    /// Deletes every player and tournament.
    fn reset(&self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RowKey {
    Tournament(TournamentId),
    Player(PlayerId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Value {
    Player(Player),
    Tournament(Tournament),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Status {
    Update(Value),
    Delete,
}

#[derive(Default)]
struct Tables {
    players: HashMap<PlayerId, Player>,
    tournaments: HashMap<TournamentId, Tournament>,
}

#[derive(Default)]
struct LockTable {
    held: HashSet<RowKey>,
    active: usize,
    resetting: bool,
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<LockTable>,
    released: Condvar,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("memory store mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// In-process store with row-level exclusive locks.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed player rows.
    pub fn player_count(&self) -> usize {
        guard(&self.shared.tables).players.len()
    }

    /// Number of open tournaments.
    pub fn tournament_count(&self) -> usize {
        guard(&self.shared.tables).tournaments.len()
    }
}

impl Store for MemoryStore {
    type Tx<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> Result<MemoryTransaction<'_>> {
        let mut locks = guard(&self.shared.locks);
        while locks.resetting {
            locks = self
                .shared
                .released
                .wait(locks)
                .unwrap_or_else(PoisonError::into_inner);
        }
        locks.active += 1;
        drop(locks);
        Ok(MemoryTransaction {
            shared: &self.shared,
            held: Vec::new(),
            pending: BTreeMap::new(),
            finished: false,
        })
    }

    fn reset(&self) -> Result<()> {
        // New transactions park in `begin` until the tables are cleared.
        let mut locks = guard(&self.shared.locks);
        while locks.resetting {
            locks = self
                .shared
                .released
                .wait(locks)
                .unwrap_or_else(PoisonError::into_inner);
        }
        locks.resetting = true;
        while locks.active > 0 {
            locks = self
                .shared
                .released
                .wait(locks)
                .unwrap_or_else(PoisonError::into_inner);
        }
        {
            let mut tables = guard(&self.shared.tables);
            tables.players.clear();
            tables.tournaments.clear();
        }
        locks.resetting = false;
        drop(locks);
        self.shared.released.notify_all();
        Ok(())
    }
}

pub struct MemoryTransaction<'a> {
    shared: &'a Shared,
    held: Vec<RowKey>,
    pending: BTreeMap<RowKey, Status>,
    finished: bool,
}

impl MemoryTransaction<'_> {
    fn acquire(&mut self, key: RowKey) {
        if self.held.contains(&key) {
            return;
        }
        let mut locks = guard(&self.shared.locks);
        while locks.held.contains(&key) {
            locks = self
                .shared
                .released
                .wait(locks)
                .unwrap_or_else(PoisonError::into_inner);
        }
        locks.held.insert(key.clone());
        self.held.push(key);
    }

    fn read(&self, key: &RowKey) -> Option<Value> {
        match self.pending.get(key) {
            Some(Status::Update(value)) => return Some(value.clone()),
            Some(Status::Delete) => return None,
            None => {}
        }
        let tables = guard(&self.shared.tables);
        match key {
            RowKey::Player(id) => tables.players.get(id).cloned().map(Value::Player),
            RowKey::Tournament(id) => tables.tournaments.get(id).cloned().map(Value::Tournament),
        }
    }

    fn finish(&mut self, commit: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let pending = std::mem::take(&mut self.pending);
        if commit {
            // Apply before releasing so no other transaction sees a partial write.
            let mut tables = guard(&self.shared.tables);
            for (key, status) in pending {
                match (key, status) {
                    (RowKey::Player(_), Status::Update(Value::Player(player))) => {
                        tables.players.insert(player.id.clone(), player);
                    }
                    (RowKey::Tournament(_), Status::Update(Value::Tournament(tournament))) => {
                        tables.tournaments.insert(tournament.id.clone(), tournament);
                    }
                    (RowKey::Player(id), _) => {
                        tables.players.remove(&id);
                    }
                    (RowKey::Tournament(id), _) => {
                        tables.tournaments.remove(&id);
                    }
                }
            }
        }
        let mut locks = guard(&self.shared.locks);
        for key in self.held.drain(..) {
            locks.held.remove(&key);
        }
        locks.active = locks.active.saturating_sub(1);
        drop(locks);
        self.shared.released.notify_all();
    }

    fn ensure_held(&self, key: &RowKey) -> Result<()> {
        if !self.held.contains(key) {
            anyhow::bail!("write to unlocked row {key:?}");
        }
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn player(&mut self, id: &PlayerId) -> Result<Option<Player>> {
        Ok(match self.read(&RowKey::Player(id.clone())) {
            Some(Value::Player(player)) => Some(player),
            _ => None,
        })
    }

    fn lock_players(&mut self, ids: &BTreeSet<PlayerId>) -> Result<BTreeMap<PlayerId, Player>> {
        let mut rows = BTreeMap::new();
        for id in ids {
            let key = RowKey::Player(id.clone());
            self.acquire(key.clone());
            if let Some(Value::Player(player)) = self.read(&key) {
                rows.insert(id.clone(), player);
            }
        }
        Ok(rows)
    }

    fn create_player(&mut self, id: &PlayerId) -> Result<Player> {
        let key = RowKey::Player(id.clone());
        self.acquire(key.clone());
        if let Some(Value::Player(player)) = self.read(&key) {
            return Ok(player);
        }
        let player = Player::new(id.clone());
        self.pending
            .insert(key, Status::Update(Value::Player(player.clone())));
        Ok(player)
    }

    fn lock_tournament(&mut self, id: &TournamentId) -> Result<Option<Tournament>> {
        let key = RowKey::Tournament(id.clone());
        self.acquire(key.clone());
        Ok(match self.read(&key) {
            Some(Value::Tournament(tournament)) => Some(tournament),
            _ => None,
        })
    }

    fn put_player(&mut self, player: &Player) -> Result<()> {
        let key = RowKey::Player(player.id.clone());
        self.ensure_held(&key)?;
        self.pending
            .insert(key, Status::Update(Value::Player(player.clone())));
        Ok(())
    }

    fn put_tournament(&mut self, tournament: &Tournament) -> Result<()> {
        let key = RowKey::Tournament(tournament.id.clone());
        self.ensure_held(&key)?;
        self.pending
            .insert(key, Status::Update(Value::Tournament(tournament.clone())));
        Ok(())
    }

    fn delete_tournament(&mut self, id: &TournamentId) -> Result<()> {
        let key = RowKey::Tournament(id.clone());
        self.ensure_held(&key)?;
        self.pending.insert(key, Status::Delete);
        Ok(())
    }

    fn commit(mut self) -> Result<()> {
        self.finish(true);
        Ok(())
    }

    fn rollback(mut self) -> Result<()> {
        self.finish(false);
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                locks = self.held.len(),
                "memory transaction dropped, rolling back"
            );
            self.finish(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn pid(id: &str) -> PlayerId {
        PlayerId::new(id).unwrap()
    }

    fn tid(id: &str) -> TournamentId {
        TournamentId::new(id).unwrap()
    }

    fn ids(values: &[&str]) -> BTreeSet<PlayerId> {
        values.iter().map(|v| pid(v)).collect()
    }

    #[test]
    fn commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.lock_players(&ids(&["alice"])).unwrap();
        let mut alice = Player::new(pid("alice"));
        alice.points = 10;
        tx.put_player(&alice).unwrap();
        assert_eq!(tx.player(&pid("alice")).unwrap(), Some(alice.clone()));
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        assert_eq!(tx.player(&pid("alice")).unwrap(), Some(alice));
        assert_eq!(store.player_count(), 1);
    }

    #[test]
    fn rollback_and_drop_discard_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.lock_tournament(&tid("t1")).unwrap();
        tx.put_tournament(&Tournament::new(tid("t1"), 100)).unwrap();
        tx.rollback().unwrap();

        {
            let mut tx = store.begin().unwrap();
            tx.lock_players(&ids(&["bob"])).unwrap();
            tx.put_player(&Player::new(pid("bob"))).unwrap();
        }

        assert_eq!(store.tournament_count(), 0);
        assert_eq!(store.player_count(), 0);
    }

    #[test]
    fn writes_require_locks() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        assert!(tx.put_player(&Player::new(pid("alice"))).is_err());
        assert!(tx.delete_tournament(&tid("t1")).is_err());
    }

    #[test]
    fn create_player_is_idempotent() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        let created = tx.create_player(&pid("alice")).unwrap();
        assert_eq!(created, Player::new(pid("alice")));
        let mut alice = created;
        alice.points = 3;
        tx.put_player(&alice).unwrap();
        assert_eq!(tx.create_player(&pid("alice")).unwrap().points, 3);
        tx.commit().unwrap();
        assert_eq!(store.player_count(), 1);
    }

    #[test]
    fn locks_are_reentrant_within_a_transaction() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.lock_players(&ids(&["alice", "bob"])).unwrap();
        tx.lock_players(&ids(&["bob", "carol"])).unwrap();
        tx.lock_tournament(&tid("t1")).unwrap();
        tx.lock_tournament(&tid("t1")).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn conflicting_lock_waits_for_release() {
        let store = MemoryStore::new();
        let mut first = store.begin().unwrap();
        first.lock_players(&ids(&["alice"])).unwrap();
        let mut alice = Player::new(pid("alice"));
        alice.points = 7;
        first.put_player(&alice).unwrap();

        let (sender, receiver) = mpsc::channel();
        let other = store.clone();
        let handle = thread::spawn(move || {
            let mut tx = other.begin().unwrap();
            let rows = tx.lock_players(&ids(&["alice"])).unwrap();
            sender.send(rows.get(&pid("alice")).map(|p| p.points)).unwrap();
            tx.commit().unwrap();
        });

        // The second transaction is parked on the lock.
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
        first.commit().unwrap();
        assert_eq!(receiver.recv().unwrap(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn reset_clears_everything() {
        let store = MemoryStore::new();
        let mut tx = store.begin().unwrap();
        tx.lock_tournament(&tid("t1")).unwrap();
        tx.put_tournament(&Tournament::new(tid("t1"), 5)).unwrap();
        tx.lock_players(&ids(&["alice"])).unwrap();
        tx.put_player(&Player::new(pid("alice"))).unwrap();
        tx.commit().unwrap();

        store.reset().unwrap();
        assert_eq!(store.player_count(), 0);
        assert_eq!(store.tournament_count(), 0);
    }

    #[test]
    fn pending_reset_holds_back_new_transactions() {
        let store = MemoryStore::new();
        let mut open = store.begin().unwrap();
        open.lock_players(&ids(&["alice"])).unwrap();
        open.put_player(&Player::new(pid("alice"))).unwrap();

        let resetter = store.clone();
        let reset = thread::spawn(move || resetter.reset().unwrap());
        while !guard(&store.shared.locks).resetting {
            thread::yield_now();
        }

        let (sender, receiver) = mpsc::channel();
        let late = store.clone();
        let newcomer = thread::spawn(move || {
            let mut tx = late.begin().unwrap();
            tx.lock_players(&ids(&["bob"])).unwrap();
            tx.put_player(&Player::new(pid("bob"))).unwrap();
            tx.commit().unwrap();
            sender.send(()).unwrap();
        });

        // The newcomer cannot start while the reset is waiting to drain.
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
        open.commit().unwrap();
        reset.join().unwrap();
        receiver.recv().unwrap();
        newcomer.join().unwrap();

        // alice was wiped by the reset; bob started after it.
        let mut tx = store.begin().unwrap();
        assert_eq!(tx.player(&pid("alice")).unwrap(), None);
        assert!(tx.player(&pid("bob")).unwrap().is_some());
        tx.rollback().unwrap();
    }
}
