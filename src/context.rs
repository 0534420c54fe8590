use uuid::Uuid;

/// Tenant scope for the current operation.
///
/// Authorization and tenancy resolution happen upstream; by the time the sync
/// engine runs, every request has already been scoped to one store. The
/// context is passed explicitly into every operation so there is no ambient
/// state to coordinate across gateway instances.
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// The store all ledger and queue rows are scoped to
    pub store_id: Uuid,

    /// The terminal that submitted the operation, when known (logging only)
    pub terminal_id: Option<String>,
}

impl StoreContext {
    pub fn new(store_id: Uuid) -> Self {
        Self {
            store_id,
            terminal_id: None,
        }
    }

    pub fn with_terminal(store_id: Uuid, terminal_id: impl Into<String>) -> Self {
        Self {
            store_id,
            terminal_id: Some(terminal_id.into()),
        }
    }

    /// Context for internal maintenance work (queue workers, requeues)
    pub fn internal(store_id: Uuid) -> Self {
        Self {
            store_id,
            terminal_id: Some("system".to_string()),
        }
    }
}
