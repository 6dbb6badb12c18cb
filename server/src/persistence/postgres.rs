use anyhow::Context;
use lifland_execution::{Store, Transaction};
use lifland_types::{Player, PlayerId, Tournament, TournamentId};
use postgres::{Client, NoTls};
use std::collections::{BTreeMap, BTreeSet};

use super::{
    encode_set, player_from_row, to_i64, tournament_from_row, validate_postgres_url, Pool,
};

/// PostgreSQL-backed store using row locks (`SELECT ... FOR UPDATE`).
///
/// Player rows are locked in `COLLATE "C"` order, which matches the byte
/// order of [PlayerId].
pub struct PostgresStore {
    url: String,
    pool: Pool<Client>,
}

impl PostgresStore {
    pub fn open(url: &str, pool_size: usize) -> anyhow::Result<Self> {
        validate_postgres_url(url)?;
        let store = Self {
            url: url.to_string(),
            pool: Pool::new(pool_size),
        };
        let mut client = store.connect()?;
        init_schema(&mut client)?;
        store.pool.put(client);
        tracing::info!(pool_size, "postgres store opened");
        Ok(store)
    }

    fn connect(&self) -> anyhow::Result<Client> {
        Client::connect(&self.url, NoTls).context("connect to postgres")
    }

    fn checkout(&self) -> anyhow::Result<Client> {
        match self.pool.take() {
            Some(client) if !client.is_closed() => Ok(client),
            _ => self.connect(),
        }
    }
}

fn init_schema(client: &mut Client) -> anyhow::Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS players (
                id TEXT PRIMARY KEY,
                points BIGINT NOT NULL CHECK (points >= 0),
                backers TEXT NOT NULL DEFAULT '[]'
            );
            CREATE TABLE IF NOT EXISTS tournaments (
                id TEXT PRIMARY KEY,
                deposit BIGINT NOT NULL CHECK (deposit > 0),
                players TEXT NOT NULL DEFAULT '[]'
            );",
        )
        .context("init postgres schema")?;
    Ok(())
}

impl Store for PostgresStore {
    type Tx<'a> = PostgresTransaction<'a>;

    fn begin(&self) -> anyhow::Result<PostgresTransaction<'_>> {
        let mut client = self.checkout()?;
        client
            .batch_execute("BEGIN")
            .context("begin postgres transaction")?;
        Ok(PostgresTransaction {
            store: self,
            client: Some(client),
        })
    }

    fn reset(&self) -> anyhow::Result<()> {
        let mut client = self.checkout()?;
        client
            .batch_execute("TRUNCATE players, tournaments")
            .context("truncate ledger tables")?;
        self.pool.put(client);
        Ok(())
    }
}

pub struct PostgresTransaction<'a> {
    store: &'a PostgresStore,
    client: Option<Client>,
}

impl PostgresTransaction<'_> {
    fn client(&mut self) -> anyhow::Result<&mut Client> {
        self.client
            .as_mut()
            .context("postgres transaction already finished")
    }

    fn select_player(&mut self, id: &PlayerId, lock: bool) -> anyhow::Result<Option<Player>> {
        let query = if lock {
            "SELECT points, backers FROM players WHERE id = $1 FOR UPDATE"
        } else {
            "SELECT points, backers FROM players WHERE id = $1"
        };
        let row = self
            .client()?
            .query_opt(query, &[&id.as_str()])
            .context("select player")?;
        row.map(|row| {
            player_from_row(
                id.as_str(),
                row.try_get(0)?,
                row.try_get::<_, &str>(1)?,
            )
        })
        .transpose()
    }

    fn finish(&mut self, statement: &str) -> anyhow::Result<()> {
        let mut client = self
            .client
            .take()
            .context("postgres transaction already finished")?;
        client
            .batch_execute(statement)
            .with_context(|| format!("postgres {statement}"))?;
        self.store.pool.put(client);
        Ok(())
    }
}

impl Transaction for PostgresTransaction<'_> {
    fn player(&mut self, id: &PlayerId) -> anyhow::Result<Option<Player>> {
        self.select_player(id, false)
    }

    fn lock_players(
        &mut self,
        ids: &BTreeSet<PlayerId>,
    ) -> anyhow::Result<BTreeMap<PlayerId, Player>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let keys: Vec<&str> = ids.iter().map(PlayerId::as_str).collect();
        let rows = self
            .client()?
            .query(
                r#"SELECT id, points, backers FROM players
                WHERE id = ANY($1)
                ORDER BY id COLLATE "C"
                FOR UPDATE"#,
                &[&keys],
            )
            .context("lock players")?;
        let mut locked = BTreeMap::new();
        for row in rows {
            let player = player_from_row(
                row.try_get::<_, &str>(0)?,
                row.try_get(1)?,
                row.try_get::<_, &str>(2)?,
            )?;
            locked.insert(player.id.clone(), player);
        }
        Ok(locked)
    }

    fn create_player(&mut self, id: &PlayerId) -> anyhow::Result<Player> {
        self.client()?
            .execute(
                "INSERT INTO players (id, points, backers) VALUES ($1, 0, '[]')
                ON CONFLICT (id) DO NOTHING",
                &[&id.as_str()],
            )
            .context("create player")?;
        self.select_player(id, true)?
            .context("player missing after insert")
    }

    fn lock_tournament(&mut self, id: &TournamentId) -> anyhow::Result<Option<Tournament>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT deposit, players FROM tournaments WHERE id = $1 FOR UPDATE",
                &[&id.as_str()],
            )
            .context("lock tournament")?;
        row.map(|row| {
            tournament_from_row(
                id.as_str(),
                row.try_get(0)?,
                row.try_get::<_, &str>(1)?,
            )
        })
        .transpose()
    }

    fn put_player(&mut self, player: &Player) -> anyhow::Result<()> {
        let points = to_i64(player.points, "points")?;
        let backers = encode_set(&player.backers)?;
        self.client()?
            .execute(
                "INSERT INTO players (id, points, backers) VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE SET points = EXCLUDED.points, backers = EXCLUDED.backers",
                &[&player.id.as_str(), &points, &backers],
            )
            .context("write player")?;
        Ok(())
    }

    fn put_tournament(&mut self, tournament: &Tournament) -> anyhow::Result<()> {
        let deposit = to_i64(tournament.deposit, "deposit")?;
        let players = encode_set(&tournament.players)?;
        self.client()?
            .execute(
                "INSERT INTO tournaments (id, deposit, players) VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE SET deposit = EXCLUDED.deposit, players = EXCLUDED.players",
                &[&tournament.id.as_str(), &deposit, &players],
            )
            .context("write tournament")?;
        Ok(())
    }

    fn delete_tournament(&mut self, id: &TournamentId) -> anyhow::Result<()> {
        self.client()?
            .execute("DELETE FROM tournaments WHERE id = $1", &[&id.as_str()])
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

impl Drop for PostgresTransaction<'_> {
    fn drop(&mut self) {
        if self.client.is_some() {
            if let Err(err) = self.finish("ROLLBACK") {
                tracing::warn!(?err, "postgres rollback on drop failed");
            }
        }
    }
}
