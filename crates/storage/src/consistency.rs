/// Local consistency scan: cross-checks every index slot against the entry log.
///
/// The scan is read-only. It walks a snapshot of the ledger table, lists each
/// index and asks the entry log whether the record at every recorded location
/// really is that entry. Failures become [`DetectedInconsistency`] values; a
/// single bad record never stops the scan.
///
/// A slot can legitimately change under the scan when a re-flush writes a
/// newer location, so a failed check re-reads the slot and retries once at
/// the new location before reporting.
use entrylog::{EntryLocation, EntryLog};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::{stats, InterleavedLedgerStorage, StorageError};

/// One index reference the entry log could not confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedInconsistency {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub reason: String,
}

impl fmt::Display for DetectedInconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ledger {} entry {}: {}", self.ledger_id, self.entry_id, self.reason)
    }
}

/// Cooperative throttle for the scan: one permit per checked entry.
pub trait RateLimit: Send + Sync {
    /// Blocks until a permit is available.
    fn acquire(&self);
}

/// Always has a permit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

impl RateLimit for Unthrottled {
    fn acquire(&self) {}
}

impl RateLimit for DefaultDirectRateLimiter {
    fn acquire(&self) {
        let clock = DefaultClock::default();
        while let Err(not_until) = self.check() {
            thread::sleep(not_until.wait_time_from(clock.now()));
        }
    }
}

/// A limiter allowing `per_second` checks, `None` for 0 (unthrottled).
pub fn rate_limiter(per_second: u32) -> Option<DefaultDirectRateLimiter> {
    NonZeroU32::new(per_second).map(|rate| RateLimiter::direct(Quota::per_second(rate)))
}

impl<L: EntryLog> InterleavedLedgerStorage<L> {
    /// Checks every indexed entry of every ledger against the entry log.
    ///
    /// `limiter` is consulted once per entry; `None` runs unthrottled. Entries
    /// still only in the write cache have no index slot yet and are not
    /// checked.
    ///
    /// # Errors
    ///
    /// An index that cannot be listed fails the whole check. Failed entry
    /// lookups never do; they are returned as inconsistencies.
    pub fn local_consistency_check(
        &self,
        limiter: Option<&dyn RateLimit>,
    ) -> Result<Vec<DetectedInconsistency>, StorageError> {
        let limiter = limiter.unwrap_or(&Unthrottled);
        let mut found = Vec::new();
        let mut checked = 0u64;

        for (ledger_id, handle) in self.ledger_snapshot() {
            let entries = {
                let mut index = handle.lock();
                if index.is_deleted() {
                    continue;
                }
                index.entries().map_err(|e| {
                    error!(ledger_id, error = %e, "cannot list index, consistency check failed");
                    e
                })?
            };

            for (entry_id, location) in entries {
                limiter.acquire();
                checked += 1;
                let Err(err) = self.entry_log.check_entry(ledger_id, entry_id, location) else {
                    continue;
                };

                // the slot may have moved on since it was listed
                let current = {
                    let mut index = handle.lock();
                    if index.is_deleted() {
                        break;
                    }
                    index.read(entry_id)
                };
                let reason = match current {
                    Ok(moved) if moved != location => {
                        match self.entry_log.check_entry(ledger_id, entry_id, moved) {
                            Ok(()) => continue,
                            Err(e) => e.to_string(),
                        }
                    }
                    Ok(_) => err.to_string(),
                    Err(e) if e.is_not_found() => {
                        debug!(ledger_id, entry_id, "entry vanished during scan");
                        continue;
                    }
                    Err(e) => {
                        warn!(ledger_id, entry_id, error = %e, "cannot re-read index slot");
                        err.to_string()
                    }
                };
                found.push(self.report(ledger_id, entry_id, location, reason));
            }
        }

        self.stats.incr(stats::INCONSISTENCIES, found.len() as u64);
        info!(checked, inconsistencies = found.len(), "local consistency check finished");
        Ok(found)
    }

    fn report(
        &self,
        ledger_id: u64,
        entry_id: u64,
        location: EntryLocation,
        reason: String,
    ) -> DetectedInconsistency {
        error!(
            ledger_id,
            entry_id,
            log_id = location.log_id,
            offset = location.offset,
            %reason,
            "inconsistent index entry"
        );
        DetectedInconsistency {
            ledger_id,
            entry_id,
            reason,
        }
    }
}
