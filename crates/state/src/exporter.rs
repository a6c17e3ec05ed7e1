//! Acknowledged exporter positions.

use conductor_storage::Position;

use crate::{Column, ColumnFamily, StateRead, StateResult, Transaction};

const POSITIONS: Column<str, Position> = Column::new(ColumnFamily::EXPORTER);

/// Per-exporter acknowledged positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExporterPositions;

impl ExporterPositions {
    /// Acknowledged position of `exporter_id`
    pub fn get<R: StateRead + ?Sized>(state: &R, exporter_id: &str) -> StateResult<Option<Position>> {
        POSITIONS.get(state, exporter_id)
    }

    /// Stage a new acknowledged position; lower positions are ignored.
    pub fn acknowledge(txn: &mut Transaction<'_>, exporter_id: &str, position: Position) -> StateResult<()> {
        match POSITIONS.get(txn, exporter_id)? {
            Some(current) if current >= position => Ok(()),
            _ => POSITIONS.put(txn, exporter_id, &position),
        }
    }

    /// Lowest acknowledged position across exporters, `None` without exporters
    pub fn lowest<R: StateRead + ?Sized>(state: &R) -> StateResult<Option<Position>> {
        Ok(POSITIONS.values(state)?.into_iter().min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStateBackend, StateStore};

    #[test]
    fn test_acknowledge_never_moves_backwards() {
        let store = StateStore::open(MemoryStateBackend::new()).unwrap();
        let mut txn = store.transaction();
        ExporterPositions::acknowledge(&mut txn, "audit", 20).unwrap();
        ExporterPositions::acknowledge(&mut txn, "audit", 5).unwrap();
        ExporterPositions::acknowledge(&mut txn, "metrics", 7).unwrap();
        txn.commit().unwrap();

        assert_eq!(ExporterPositions::get(&store, "audit").unwrap(), Some(20));
        assert_eq!(ExporterPositions::lowest(&store).unwrap(), Some(7));
    }
}
