//! Once-only creation of the output table
//!
//! One worker creates the table; every worker waits for the gate to open
//! before it opens a writer. If creation fails, waiters are released as
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::error::{CollapseError, Result};
use crate::schema::OutputSchema;
use crate::store::TargetStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Failed,
}

/// Barrier between table creation and the first write
#[derive(Debug)]
pub struct SchemaGate {
    state: watch::Sender<GateState>,
    claimed: AtomicBool,
}

impl SchemaGate {
    /// Gate that opens once [`SchemaGate::create_once`] succeeds
    #[must_use]
    pub fn pending() -> Self {
        Self {
            state: watch::Sender::new(GateState::Pending),
            claimed: AtomicBool::new(false),
        }
    }

    /// Gate for a table that already exists
    #[must_use]
    pub fn open() -> Self {
        Self {
            state: watch::Sender::new(GateState::Open),
            claimed: AtomicBool::new(true),
        }
    }

    /// Create the table unless someone already claimed the job
    ///
    /// Returns whether this call created it.
    pub async fn create_once(&self, target: &dyn TargetStore, schema: &OutputSchema) -> Result<bool> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        log::info!("Creating output table in {}", target.describe());
        match target.create_schema(schema).await {
            Ok(()) => {
                self.state.send_replace(GateState::Open);
                Ok(true)
            }
            Err(e) => {
                self.state.send_replace(GateState::Failed);
                Err(e)
            }
        }
    }

    /// Release all waiters as cancelled if the gate has not opened yet
    pub fn fail(&self) {
        self.claimed.store(true, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if *state == GateState::Pending {
                *state = GateState::Failed;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the table exists
    pub async fn wait(&self, shard: usize) -> Result<()> {
        let mut state = self.state.subscribe();
        let open = state
            .wait_for(|s| *s != GateState::Pending)
            .await
            .map(|s| *s == GateState::Open)
            .unwrap_or(false);
        if open { Ok(()) } else { Err(CollapseError::Cancelled(shard)) }
    }

    /// Whether the gate is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.state.borrow() == GateState::Open
    }
}
