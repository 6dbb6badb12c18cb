//! Types shared by the lifland engine and server.

pub mod api;
mod ids;
mod ledger;

pub use ids::{IdError, PlayerId, TournamentId, MAX_ID_LENGTH};
pub use ledger::{Player, Tournament, Winner};
