use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Connection identities marked as unhealthy, pending replacement on their next lease.
#[derive(Default)]
pub(crate) struct ConnectionFlags {
    flagged: RwLock<HashMap<u64, bool>>,
}

impl ConnectionFlags {
    pub(crate) fn flag(&self, connection_id: u64) {
        self.set(connection_id, true);
    }

    pub(crate) fn unflag(&self, connection_id: u64) {
        self.set(connection_id, false);
    }

    pub(crate) fn is_flagged(&self, connection_id: u64) -> bool {
        self.flagged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection_id)
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn clear(&self) {
        self.flagged
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn set(&self, connection_id: u64, flagged: bool) {
        self.flagged
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, flagged);
    }
}
