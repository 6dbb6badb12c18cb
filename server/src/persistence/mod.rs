//! Durable [Store] backends and the runtime switch between them.

use anyhow::{bail, Context};
use lifland_execution::{MemoryStore, MemoryTransaction, Store, Transaction};
use lifland_types::{Player, PlayerId, Tournament, TournamentId};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use url::Url;

use crate::config::{BackendKind, ServerConfig};

mod postgres;
mod sqlite;

pub use self::postgres::{PostgresStore, PostgresTransaction};
pub use self::sqlite::{SqliteStore, SqliteTransaction};

/// Store selected at startup.
pub enum LedgerStore {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

pub enum LedgerTransaction<'a> {
    Memory(MemoryTransaction<'a>),
    Sqlite(SqliteTransaction<'a>),
    Postgres(PostgresTransaction<'a>),
}

impl LedgerStore {
    pub fn open(config: &ServerConfig) -> anyhow::Result<Self> {
        Ok(match config.backend {
            BackendKind::Memory => Self::Memory(MemoryStore::new()),
            BackendKind::Sqlite => Self::Sqlite(
                SqliteStore::open(&config.sqlite_path, config.sqlite_busy_timeout())
                    .with_context(|| {
                        format!("open sqlite store at {}", config.sqlite_path.display())
                    })?,
            ),
            BackendKind::Postgres => {
                let url = config
                    .postgres_url
                    .as_deref()
                    .context("postgres backend requires postgres_url")?;
                Self::Postgres(
                    PostgresStore::open(url, config.postgres_pool_size)
                        .context("open postgres store")?,
                )
            }
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory(_) => BackendKind::Memory,
            Self::Sqlite(_) => BackendKind::Sqlite,
            Self::Postgres(_) => BackendKind::Postgres,
        }
    }
}

impl Store for LedgerStore {
    type Tx<'a> = LedgerTransaction<'a>;

    fn begin(&self) -> anyhow::Result<LedgerTransaction<'_>> {
        Ok(match self {
            Self::Memory(store) => LedgerTransaction::Memory(store.begin()?),
            Self::Sqlite(store) => LedgerTransaction::Sqlite(store.begin()?),
            Self::Postgres(store) => LedgerTransaction::Postgres(store.begin()?),
        })
    }

    fn reset(&self) -> anyhow::Result<()> {
        match self {
            Self::Memory(store) => store.reset(),
            Self::Sqlite(store) => store.reset(),
            Self::Postgres(store) => store.reset(),
        }
    }
}

macro_rules! dispatch {
    ($tx:expr, $inner:ident => $call:expr) => {
        match $tx {
            LedgerTransaction::Memory($inner) => $call,
            LedgerTransaction::Sqlite($inner) => $call,
            LedgerTransaction::Postgres($inner) => $call,
        }
    };
}

impl Transaction for LedgerTransaction<'_> {
    fn player(&mut self, id: &PlayerId) -> anyhow::Result<Option<Player>> {
        dispatch!(self, tx => tx.player(id))
    }

    fn lock_players(
        &mut self,
        ids: &BTreeSet<PlayerId>,
    ) -> anyhow::Result<BTreeMap<PlayerId, Player>> {
        dispatch!(self, tx => tx.lock_players(ids))
    }

    fn create_player(&mut self, id: &PlayerId) -> anyhow::Result<Player> {
        dispatch!(self, tx => tx.create_player(id))
    }

    fn lock_tournament(&mut self, id: &TournamentId) -> anyhow::Result<Option<Tournament>> {
        dispatch!(self, tx => tx.lock_tournament(id))
    }

    fn put_player(&mut self, player: &Player) -> anyhow::Result<()> {
        dispatch!(self, tx => tx.put_player(player))
    }

    fn put_tournament(&mut self, tournament: &Tournament) -> anyhow::Result<()> {
        dispatch!(self, tx => tx.put_tournament(tournament))
    }

    fn delete_tournament(&mut self, id: &TournamentId) -> anyhow::Result<()> {
        dispatch!(self, tx => tx.delete_tournament(id))
    }

    fn commit(self) -> anyhow::Result<()> {
        dispatch!(self, tx => tx.commit())
    }

    fn rollback(self) -> anyhow::Result<()> {
        dispatch!(self, tx => tx.rollback())
    }
}

/// Idle connections kept for reuse.
struct Pool<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> Pool<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<C>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("connection pool lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn take(&self) -> Option<C> {
        self.idle().pop()
    }

    fn put(&self, conn: C) {
        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

fn validate_postgres_url(url: &str) -> anyhow::Result<()> {
    if allow_public_postgres() {
        return Ok(());
    }

    let parsed = Url::parse(url).context("parse postgres url")?;
    let scheme = parsed.scheme();
    if scheme != "postgres" && scheme != "postgresql" {
        bail!("postgres url must start with postgres:// or postgresql://");
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("postgres url missing host"))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Ok(());
        }
        bail!("postgres host is public; set LIFLAND_DB_ALLOW_PUBLIC=1 to override");
    }

    if allow_postgres_hostname() {
        return Ok(());
    }

    bail!("postgres host must be a private IP; set LIFLAND_DB_ALLOW_HOSTNAME=1 to allow hostnames");
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

fn allow_public_postgres() -> bool {
    env_flag("LIFLAND_DB_ALLOW_PUBLIC")
}

fn allow_postgres_hostname() -> bool {
    env_flag("LIFLAND_DB_ALLOW_HOSTNAME")
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    }
}

fn to_i64(value: u64, label: &str) -> anyhow::Result<i64> {
    i64::try_from(value).with_context(|| format!("convert {label} to i64"))
}

fn from_i64(value: i64, label: &str) -> anyhow::Result<u64> {
    u64::try_from(value).with_context(|| format!("{label} is negative"))
}

/// Sets are stored as JSON arrays.
fn encode_set<T: Serialize>(set: &BTreeSet<T>) -> anyhow::Result<String> {
    serde_json::to_string(set).context("encode id set")
}

fn decode_set<T: DeserializeOwned + Ord>(raw: &str) -> anyhow::Result<BTreeSet<T>> {
    serde_json::from_str(raw).context("decode id set")
}

fn player_from_row(id: &str, points: i64, backers: &str) -> anyhow::Result<Player> {
    Ok(Player {
        id: PlayerId::new(id).context("stored player id")?,
        points: from_i64(points, "points")?,
        backers: decode_set(backers)?,
    })
}

fn tournament_from_row(id: &str, deposit: i64, players: &str) -> anyhow::Result<Tournament> {
    Ok(Tournament {
        id: TournamentId::new(id).context("stored tournament id")?,
        deposit: from_i64(deposit, "deposit")?,
        players: decode_set(players)?,
    })
}
