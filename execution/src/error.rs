use lifland_types::{IdError, PlayerId, TournamentId};
use thiserror::Error;

/// Coarse classification used by adapters to pick a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InsufficientFunds,
    NotFound,
    Conflict,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    InvalidId(#[from] IdError),
    #[error("deposit must be > 0")]
    InvalidDeposit,
    #[error("player {player} has insufficient funds (balance={balance}, required={required})")]
    InsufficientFunds {
        player: PlayerId,
        balance: u64,
        required: u64,
    },
    #[error(
        "player {player} has insufficient funds (balance={balance}, deposit={deposit}) and no backers were provided"
    )]
    InsufficientFundsNoBackers {
        player: PlayerId,
        balance: u64,
        deposit: u64,
    },
    #[error("backer {backer} has insufficient funds (balance={balance}, share={share})")]
    BackerInsufficientFunds {
        backer: PlayerId,
        balance: u64,
        share: u64,
    },
    #[error("no such player: {0}")]
    NoSuchPlayer(PlayerId),
    #[error("no such tournament: {0}")]
    NoSuchTournament(TournamentId),
    #[error("player {player} is not registered in tournament {tournament}")]
    PlayerNotRegistered {
        player: PlayerId,
        tournament: TournamentId,
    },
    #[error("player {player} is already registered in tournament {tournament}")]
    AlreadyRegistered {
        player: PlayerId,
        tournament: TournamentId,
    },
    #[error("crediting {amount} to {player} would overflow the balance")]
    BalanceOverflow { player: PlayerId, amount: u64 },
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidId(_) | EngineError::InvalidDeposit => ErrorKind::Validation,
            EngineError::InsufficientFunds { .. }
            | EngineError::InsufficientFundsNoBackers { .. }
            | EngineError::BackerInsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            EngineError::NoSuchPlayer(_)
            | EngineError::NoSuchTournament(_)
            | EngineError::PlayerNotRegistered { .. } => ErrorKind::NotFound,
            EngineError::AlreadyRegistered { .. } | EngineError::BalanceOverflow { .. } => {
                ErrorKind::Conflict
            }
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}
