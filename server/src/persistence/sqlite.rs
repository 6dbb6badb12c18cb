use anyhow::Context;
use lifland_execution::{Store, Transaction};
use lifland_types::{Player, PlayerId, Tournament, TournamentId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{encode_set, player_from_row, to_i64, tournament_from_row, Pool};

const MAX_IDLE_CONNECTIONS: usize = 4;

/// SQLite-backed store.
///
/// Every transaction starts with `BEGIN IMMEDIATE`, taking the database
/// write lock up front, so row locks are implied and writers are serialised.
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    pool: Pool<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout,
            pool: Pool::new(MAX_IDLE_CONNECTIONS),
        };
        let conn = store.connect()?;
        init_schema(&conn)?;
        store.pool.put(conn);
        tracing::info!(path = %path.display(), "sqlite store opened");
        Ok(store)
    }

    fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path).context("open sqlite db")?;
        conn.busy_timeout(self.busy_timeout)
            .context("set sqlite busy timeout")?;
        Ok(conn)
    }

    fn checkout(&self) -> anyhow::Result<Connection> {
        match self.pool.take() {
            Some(conn) => Ok(conn),
            None => self.connect(),
        }
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS players (
            id TEXT PRIMARY KEY,
            points INTEGER NOT NULL,
            backers TEXT NOT NULL DEFAULT '[]'
        );
        CREATE TABLE IF NOT EXISTS tournaments (
            id TEXT PRIMARY KEY,
            deposit INTEGER NOT NULL,
            players TEXT NOT NULL DEFAULT '[]'
        );",
    )
    .context("init sqlite schema")?;
    Ok(())
}

impl Store for SqliteStore {
    type Tx<'a> = SqliteTransaction<'a>;

    fn begin(&self) -> anyhow::Result<SqliteTransaction<'_>> {
        let conn = self.checkout()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .context("begin sqlite transaction")?;
        Ok(SqliteTransaction {
            store: self,
            conn: Some(conn),
        })
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut conn = self.checkout()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin sqlite reset")?;
        tx.execute("DELETE FROM players", [])?;
        tx.execute("DELETE FROM tournaments", [])?;
        tx.commit().context("commit sqlite reset")?;
        self.pool.put(conn);
        Ok(())
    }
}

pub struct SqliteTransaction<'a> {
    store: &'a SqliteStore,
    conn: Option<Connection>,
}

impl SqliteTransaction<'_> {
    fn conn(&self) -> anyhow::Result<&Connection> {
        self.conn
            .as_ref()
            .context("sqlite transaction already finished")
    }

    fn select_player(&self, id: &PlayerId) -> anyhow::Result<Option<Player>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT points, backers FROM players WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("select player")?;
        row.map(|(points, backers)| player_from_row(id.as_str(), points, &backers))
            .transpose()
    }

    fn finish(&mut self, statement: &str) -> anyhow::Result<()> {
        let conn = self
            .conn
            .take()
            .context("sqlite transaction already finished")?;
        match conn.execute_batch(statement) {
            Ok(()) => {
                self.store.pool.put(conn);
                Ok(())
            }
            Err(err) => {
                // The connection may still be inside the transaction.
                let _ = conn.execute_batch("ROLLBACK");
                Err(err).with_context(|| format!("sqlite {statement}"))
            }
        }
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn player(&mut self, id: &PlayerId) -> anyhow::Result<Option<Player>> {
        self.select_player(id)
    }

    fn lock_players(
        &mut self,
        ids: &BTreeSet<PlayerId>,
    ) -> anyhow::Result<BTreeMap<PlayerId, Player>> {
        let mut rows = BTreeMap::new();
        for id in ids {
            if let Some(player) = self.select_player(id)? {
                rows.insert(id.clone(), player);
            }
        }
        Ok(rows)
    }

    fn create_player(&mut self, id: &PlayerId) -> anyhow::Result<Player> {
        self.conn()?
            .execute(
                "INSERT OR IGNORE INTO players (id, points, backers) VALUES (?1, 0, '[]')",
                params![id.as_str()],
            )
            .context("create player")?;
        self.select_player(id)?
            .context("player missing after insert")
    }

    fn lock_tournament(&mut self, id: &TournamentId) -> anyhow::Result<Option<Tournament>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT deposit, players FROM tournaments WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("select tournament")?;
        row.map(|(deposit, players)| tournament_from_row(id.as_str(), deposit, &players))
            .transpose()
    }

    fn put_player(&mut self, player: &Player) -> anyhow::Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO players (id, points, backers) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET points = excluded.points, backers = excluded.backers",
                params![
                    player.id.as_str(),
                    to_i64(player.points, "points")?,
                    encode_set(&player.backers)?
                ],
            )
            .context("write player")?;
        Ok(())
    }

    fn put_tournament(&mut self, tournament: &Tournament) -> anyhow::Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO tournaments (id, deposit, players) VALUES (?1, ?2, ?3)
                ON CONFLICT(id) DO UPDATE SET deposit = excluded.deposit, players = excluded.players",
                params![
                    tournament.id.as_str(),
                    to_i64(tournament.deposit, "deposit")?,
                    encode_set(&tournament.players)?
                ],
            )
            .context("write tournament")?;
        Ok(())
    }

    fn delete_tournament(&mut self, id: &TournamentId) -> anyhow::Result<()> {
        self.conn()?
            .execute("DELETE FROM tournaments WHERE id = ?1", params![id.as_str()])
            .context("delete tournament")?;
        Ok(())
    }

    fn commit(mut self) -> anyhow::Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(mut self) -> anyhow::Result<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(err) = self.finish("ROLLBACK") {
                tracing::warn!(?err, "sqlite rollback on drop failed");
            }
        }
    }
}
