use lifland_types::{Player, PlayerId};
use std::collections::{BTreeMap, BTreeSet};

use crate::EngineError;

/// Removes `amount` points from `player`.
pub fn debit(player: &mut Player, amount: u64) -> Result<(), EngineError> {
    if player.points < amount {
        return Err(EngineError::InsufficientFunds {
            player: player.id.clone(),
            balance: player.points,
            required: amount,
        });
    }
    player.points -= amount;
    Ok(())
}

/// Adds `amount` points to `player`.
pub fn credit(player: &mut Player, amount: u64) -> Result<(), EngineError> {
    player.points =
        player
            .points
            .checked_add(amount)
            .ok_or_else(|| EngineError::BalanceOverflow {
                player: player.id.clone(),
                amount,
            })?;
    Ok(())
}

/// Working copy of the player rows locked by one transaction.
///
/// Tracks which rows were touched so only those are written back.
#[derive(Debug, Default)]
pub struct Snapshot {
    rows: BTreeMap<PlayerId, Player>,
    dirty: BTreeSet<PlayerId>,
}

impl Snapshot {
    pub fn new(rows: BTreeMap<PlayerId, Player>) -> Self {
        Self {
            rows,
            dirty: BTreeSet::new(),
        }
    }

    pub fn get(&self, id: &PlayerId) -> Result<&Player, EngineError> {
        self.rows
            .get(id)
            .ok_or_else(|| EngineError::NoSuchPlayer(id.clone()))
    }

    pub fn get_mut(&mut self, id: &PlayerId) -> Result<&mut Player, EngineError> {
        let player = self
            .rows
            .get_mut(id)
            .ok_or_else(|| EngineError::NoSuchPlayer(id.clone()))?;
        self.dirty.insert(id.clone());
        Ok(player)
    }

    /// Rows modified since the snapshot was taken, in id order.
    pub fn dirty(&self) -> impl Iterator<Item = &Player> {
        self.dirty.iter().filter_map(|id| self.rows.get(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str, points: u64) -> Player {
        let mut player = Player::new(PlayerId::new(id).unwrap());
        player.points = points;
        player
    }

    #[test]
    fn debit_rejects_overdraft() {
        let mut alice = player("alice", 10);
        debit(&mut alice, 10).unwrap();
        assert_eq!(alice.points, 0);

        let err = debit(&mut alice, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds { balance: 0, required: 1, .. }
        ));
        assert_eq!(alice.points, 0);
    }

    #[test]
    fn credit_rejects_overflow() {
        let mut alice = player("alice", u64::MAX - 1);
        credit(&mut alice, 1).unwrap();
        assert_eq!(alice.points, u64::MAX);
        assert!(matches!(
            credit(&mut alice, 1),
            Err(EngineError::BalanceOverflow { amount: 1, .. })
        ));
        assert_eq!(alice.points, u64::MAX);
    }

    #[test]
    fn zero_amounts_are_noops() {
        let mut alice = player("alice", 3);
        credit(&mut alice, 0).unwrap();
        debit(&mut alice, 0).unwrap();
        assert_eq!(alice.points, 3);
    }

    #[test]
    fn snapshot_tracks_touched_rows() {
        let rows = [player("alice", 1), player("bob", 2), player("carol", 3)]
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let mut snapshot = Snapshot::new(rows);
        credit(snapshot.get_mut(&PlayerId::new("carol").unwrap()).unwrap(), 5).unwrap();
        assert_eq!(snapshot.get(&PlayerId::new("bob").unwrap()).unwrap().points, 2);

        let dirty: Vec<_> = snapshot.dirty().map(|p| p.id.as_str()).collect();
        assert_eq!(dirty, ["carol"]);
        assert!(matches!(
            snapshot.get(&PlayerId::new("erin").unwrap()),
            Err(EngineError::NoSuchPlayer(_))
        ));
    }
}
