//! The ledger entity: an aggregate derived entirely by replaying its events.

use serde::{Deserialize, Serialize};

use crate::event::LedgerEvent;
use crate::message::{Amount, EntityId};

/// Derived state of one ledger entity.
///
/// Never persisted separately -- reconstructed by folding the id's event
/// history in persisted order through [`apply`](Entity::apply). The entity
/// exists once any event has been applied; a withdrawal-first history is
/// valid and yields a negative balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// True once the first event of either kind has been applied.
    pub exists: bool,
    /// Sum of deposit amounts minus sum of withdrawal amounts.
    pub balance: Amount,
}

impl Entity {
    /// A not-yet-existing entity with a zero balance.
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            exists: false,
            balance: Amount::ZERO,
        }
    }

    /// Fold one event into the state. Pure and total.
    pub fn apply(mut self, event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::Deposited(info) => self.balance += info.amount,
            LedgerEvent::Withdrawn(info) => self.balance -= info.amount,
        }
        self.exists = true;
        self
    }

    /// Rebuild an entity by folding `events` in order.
    pub fn replay<'a>(id: EntityId, events: impl IntoIterator<Item = &'a LedgerEvent>) -> Self {
        events
            .into_iter()
            .fold(Self::new(id), |entity, event| entity.apply(event))
    }
}
