use serde::{Deserialize, Serialize};

use crate::{Player, PlayerId, TournamentId, Winner};

/// Public view of a player. The backer set is never exposed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerBalance {
    pub id: PlayerId,
    pub balance: u64,
}

impl From<&Player> for PlayerBalance {
    fn from(player: &Player) -> Self {
        Self {
            id: player.id.clone(),
            balance: player.points,
        }
    }
}

/// Body of `POST /resultTournament`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentResult {
    pub tournament_id: TournamentId,
    #[serde(default)]
    pub winners: Vec<Winner>,
}

/// Arithmetic of a sponsored join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sponsorship {
    pub share: u64,
    pub backers: usize,
    /// Points of the deposit not covered by any share (floor division loss).
    pub remainder: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReceipt {
    pub tournament_id: TournamentId,
    pub player_id: PlayerId,
    pub deposit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sponsorship: Option<Sponsorship>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerPayout {
    pub player_id: PlayerId,
    pub prize: u64,
    pub backer_share: u64,
    pub repaid: Vec<PlayerId>,
    /// Points of the prize kept by the winner because of floor division.
    pub remainder: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub tournament_id: TournamentId,
    pub payouts: Vec<WinnerPayout>,
}

/// Error body returned by the HTTP adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}
