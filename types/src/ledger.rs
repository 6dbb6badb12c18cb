use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{PlayerId, TournamentId};

/// Durable player row.
///
/// `backers` holds the pending sponsorship obligations: every id in the set is
/// owed a share of this player's next prize, whichever tournament pays it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub points: u64,
    #[serde(default)]
    pub backers: BTreeSet<PlayerId>,
}

impl Player {
    /// A fresh player with a zero balance and no obligations.
    pub fn new(id: PlayerId) -> Self {
        Self {
            id,
            points: 0,
            backers: BTreeSet::new(),
        }
    }
}

/// Durable tournament row. Only open tournaments are stored; settlement deletes the row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: TournamentId,
    pub deposit: u64,
    #[serde(default)]
    pub players: BTreeSet<PlayerId>,
}

impl Tournament {
    pub fn new(id: TournamentId, deposit: u64) -> Self {
        Self {
            id,
            deposit,
            players: BTreeSet::new(),
        }
    }

    pub fn is_registered(&self, player: &PlayerId) -> bool {
        self.players.contains(player)
    }
}

/// One entry of a tournament result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub player_id: PlayerId,
    pub prize: u64,
}
