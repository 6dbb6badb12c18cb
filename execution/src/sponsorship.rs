use lifland_types::{api::Sponsorship, PlayerId};

use crate::{
    ledger::{credit, debit, Snapshot},
    EngineError,
};

/// Splits `deposit` between `player` and `backers`.
///
/// Every backer (duplicates included, in the given order) pays
/// `deposit / (backers + 1)` to the player and is recorded as owed a share of
/// the player's next prize. The player still has to pay the full deposit
/// afterwards; the truncation remainder comes out of the player's own balance.
pub fn sponsor(
    snapshot: &mut Snapshot,
    player: &PlayerId,
    deposit: u64,
    backers: &[PlayerId],
) -> Result<Sponsorship, EngineError> {
    if backers.is_empty() {
        return Err(EngineError::InsufficientFundsNoBackers {
            player: player.clone(),
            balance: snapshot.get(player)?.points,
            deposit,
        });
    }

    let parts = backers.len() as u64 + 1;
    let share = deposit / parts;
    for backer in backers {
        let row = snapshot.get_mut(backer)?;
        let balance = row.points;
        debit(row, share).map_err(|_| EngineError::BackerInsufficientFunds {
            backer: backer.clone(),
            balance,
            share,
        })?;

        let row = snapshot.get_mut(player)?;
        credit(row, share)?;
        row.backers.insert(backer.clone());
    }

    Ok(Sponsorship {
        share,
        backers: backers.len(),
        remainder: deposit - share * parts,
    })
}
