use lifland_types::{api::WinnerPayout, Winner};

use crate::{
    ledger::{credit, debit, Snapshot},
    EngineError,
};

/// Credits a winner's prize and repays everyone who backed them.
///
/// Each backer receives `prize / (backers + 1)` taken from the winner, and the
/// obligation is cleared. Backers and the winner must be present in `snapshot`.
pub fn pay_out(snapshot: &mut Snapshot, winner: &Winner) -> Result<WinnerPayout, EngineError> {
    let row = snapshot.get_mut(&winner.player_id)?;
    credit(row, winner.prize)?;
    let backers = std::mem::take(&mut row.backers);

    if backers.is_empty() {
        return Ok(WinnerPayout {
            player_id: winner.player_id.clone(),
            prize: winner.prize,
            backer_share: 0,
            repaid: Vec::new(),
            remainder: 0,
        });
    }

    let parts = backers.len() as u64 + 1;
    let share = winner.prize / parts;
    for backer in &backers {
        debit(snapshot.get_mut(&winner.player_id)?, share)?;
        credit(snapshot.get_mut(backer)?, share)?;
    }

    Ok(WinnerPayout {
        player_id: winner.player_id.clone(),
        prize: winner.prize,
        backer_share: share,
        repaid: backers.into_iter().collect(),
        remainder: winner.prize - share * parts,
    })
}
