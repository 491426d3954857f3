//! Per-printer mutual exclusion.
//!
//! Interleaving two raw payload streams on one device corrupts the printer's
//! parser state, so at most one job prints to a given `printer_ref` at a
//! time. Jobs for different printers run in parallel.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct PrinterLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held for the life of a job on one printer. Dropping it releases the
/// printer, whichever way the job ended.
pub type PrinterGuard = OwnedMutexGuard<()>;

impl PrinterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, printer_ref: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(printer_ref.to_owned()).or_default().clone()
    }

    /// Waits for exclusive use of `printer_ref`.
    pub async fn acquire(&self, printer_ref: &str) -> PrinterGuard {
        self.lock_for(printer_ref).lock_owned().await
    }

    /// Takes `printer_ref` only if nobody holds it.
    pub fn try_acquire(&self, printer_ref: &str) -> Option<PrinterGuard> {
        self.lock_for(printer_ref).try_lock_owned().ok()
    }
}
