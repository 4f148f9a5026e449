//! Last-Write-Wins conflict resolution for ledger cells.

use crate::sync::models::Message;
use uuid::Uuid;

/// The message that last wrote a cell.
///
/// Field order is the comparison order: timestamp, then device id, then
/// sequence. Two distinct messages never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellVersion {
    pub timestamp: u64,
    pub device_id: Uuid,
    pub sequence: u64,
}

impl From<&Message> for CellVersion {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            device_id: message.device_id,
            sequence: message.sequence,
        }
    }
}

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The incoming message becomes the cell's value.
    AcceptIncoming,
    /// The current value stays; the incoming message is superseded.
    KeepCurrent,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a write to a cell whose current winner is `current`.
    ///
    /// Arrival order plays no part, so every replica that has seen the same
    /// set of messages settles on the same winner.
    pub fn resolve(current: Option<&CellVersion>, incoming: &CellVersion) -> Resolution {
        match current {
            Some(current) if current >= incoming => Resolution::KeepCurrent,
            _ => Resolution::AcceptIncoming,
        }
    }
}
