//! Shutdown reconciliation of the shared connection count.
//!
//! Connections still open when the process drains are severed without a
//! clean detach, so their contribution is subtracted here instead. The
//! read-modify-write is not atomic: a concurrent increment from another
//! process between `GET` and `SET` is lost. Counts are eventually
//! consistent, not exact.

use std::sync::Arc;

use metrics::counter;
use relay_core::constants::CONNECTION_COUNT_KEY;
use relay_core::{RelayError, Result};
use relay_store::{CounterStore, RelayStore};
use tracing::{error, info};

use crate::metrics::INVARIANT_VIOLATIONS_TOTAL;
use crate::registry::ConnectionRegistry;

/// What a reconcile run did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local contribution was already 0.
    Noop,
    /// The store was rewritten.
    Adjusted {
        /// Value read from the store (absent reads as 0).
        before: i64,
        /// Value written back.
        after: i64,
        /// Local contribution removed.
        released: u64,
    },
}

/// Removes this process's contribution from the shared count.
pub struct Reconciler {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RelayStore>,
}

impl Reconciler {
    /// Create a reconciler over `registry` and `store`.
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn RelayStore>) -> Self {
        Self { registry, store }
    }

    /// Subtract `LocalCount()` from the stored total (floor 0), then release
    /// the local contribution so a second run is a no-op.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let local = self.registry.local_count();
        if local == 0 {
            info!("nothing to reconcile");
            return Ok(ReconcileOutcome::Noop);
        }

        let before = self.store.get(CONNECTION_COUNT_KEY).await?.unwrap_or(0);
        let after = adjusted_total(before, local);
        self.store.set(CONNECTION_COUNT_KEY, after).await?;
        let _ = self.registry.release_local(local);

        info!(before, after, released = local, "shared connection count reconciled");
        Ok(ReconcileOutcome::Adjusted {
            before,
            after,
            released: local,
        })
    }
}

/// `max(0, before - local)`, logging an invariant violation when the floor applies.
fn adjusted_total(before: i64, local: u64) -> i64 {
    let local = i64::try_from(local).unwrap_or(i64::MAX);
    let raw = before.saturating_sub(local);
    if raw < 0 {
        counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
        let err = RelayError::InvariantViolation(format!(
            "store total {before} below local contribution {local}"
        ));
        error!(error = %err, "clamping reconciled count to 0");
        0
    } else {
        raw
    }
}

/// Set the counter to 0 if no process has created it yet. Returns whether
/// it was written.
pub async fn ensure_counter_initialized<S: CounterStore + ?Sized>(store: &S) -> Result<bool> {
    let written = store.set_if_absent(CONNECTION_COUNT_KEY, 0).await?;
    if written {
        info!(key = CONNECTION_COUNT_KEY, "initialized shared connection count");
    }
    Ok(written)
}
