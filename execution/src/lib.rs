//! Lifland ledger engine.
//!
//! The [Engine] runs funding, joins (with sponsorship) and settlement against
//! any [Store]. Every operation executes inside exactly one store transaction:
//! rows are locked up front (the tournament first, then players in ascending
//! id order), mutated on an in-memory [ledger::Snapshot], written back and
//! committed. Any error rolls the transaction back before it is returned.
//!
//! ```rust
//! use lifland_execution::{Engine, EngineConfig, MemoryStore};
//! use lifland_types::{PlayerId, TournamentId, Winner};
//!
//! # fn main() -> Result<(), lifland_execution::EngineError> {
//! let engine = Engine::new(MemoryStore::new(), EngineConfig::default());
//! let alice = PlayerId::new("alice")?;
//! let bob = PlayerId::new("bob")?;
//! let t1 = TournamentId::new("t1")?;
//!
//! engine.fund_player(&alice, 50)?;
//! engine.fund_player(&bob, 200)?;
//! engine.announce_tournament(&t1, 100)?;
//! engine.join_tournament(&t1, &alice, &[bob.clone()])?;
//! engine.result_tournament(&t1, &[Winner { player_id: alice.clone(), prize: 200 }])?;
//!
//! assert_eq!(engine.player(&alice)?.balance, 100);
//! assert_eq!(engine.player(&bob)?.balance, 250);
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
pub mod ledger;
pub mod settlement;
pub mod sponsorship;
pub mod store;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

#[cfg(test)]
mod tests;

pub use engine::{Engine, EngineConfig, DEFAULT_FUND_CREATES_PLAYER, DEFAULT_MAX_LOCK_ATTEMPTS};
pub use error::{EngineError, ErrorKind};
pub use store::{MemoryStore, MemoryTransaction, Store, Transaction};
