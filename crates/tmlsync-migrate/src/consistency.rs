//! Wait for freshly imported objects to show up in the metadata listing.
//!
//! The remote indexes imports asynchronously, so tagging or sharing an object
//! straight after import can miss it. The waiter polls the listing in chunks
//! until every GUID has been seen, bounded by `WaitPolicy::timeout` and the
//! run's `CancelToken`. Results are correlated by GUID, never by position.

use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use tmlsync_content::MetadataType;

use crate::api::{ContentApi, ContentFilter};
use crate::context::{CancelToken, WaitPolicy};
use crate::error::MigrationError;

/// Upper bound on identifiers per listing call.
pub const MAX_GUIDS_PER_CALL: usize = 25;

/// Longest single sleep between cancellation checks.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

pub struct ConsistencyWaiter<'a> {
    api: &'a dyn ContentApi,
    policy: WaitPolicy,
    cancel: CancelToken,
}

impl<'a> ConsistencyWaiter<'a> {
    pub fn new(api: &'a dyn ContentApi, policy: WaitPolicy, cancel: CancelToken) -> Self {
        Self { api, policy, cancel }
    }

    /// Block until every GUID in `guids` is listed under one of `types`.
    /// Returns the number of polling rounds taken.
    pub fn wait_until_visible(
        &self,
        guids: &[String],
        types: &[MetadataType],
    ) -> Result<usize, MigrationError> {
        let mut pending: BTreeSet<String> = guids.iter().map(|g| g.to_ascii_lowercase()).collect();
        let total = pending.len();
        if total == 0 {
            return Ok(0);
        }

        let started = Instant::now();
        let mut rounds = 0;
        loop {
            rounds += 1;
            self.poll_once(&mut pending, types)?;
            tracing::debug!(round = rounds, pending = pending.len(), total, "consistency poll");
            if pending.is_empty() {
                tracing::info!(total, rounds, "imported objects are visible");
                return Ok(rounds);
            }

            let waited = started.elapsed();
            if waited >= self.policy.timeout {
                return Err(MigrationError::ConsistencyTimeout {
                    pending: pending.len(),
                    total,
                    waited,
                });
            }
            let remaining = self.policy.timeout - waited;
            self.sleep(self.policy.poll_interval.min(remaining))?;
        }
    }

    fn poll_once(
        &self,
        pending: &mut BTreeSet<String>,
        types: &[MetadataType],
    ) -> Result<(), MigrationError> {
        for metadata_type in types {
            let ask: Vec<String> = pending.iter().cloned().collect();
            for chunk in ask.chunks(MAX_GUIDS_PER_CALL) {
                self.cancel.check()?;
                let filter = ContentFilter::by_guids(chunk, *metadata_type);
                for header in self.api.list_content(&filter)? {
                    pending.remove(&header.guid.to_ascii_lowercase());
                }
            }
            if pending.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn sleep(&self, total: Duration) -> Result<(), MigrationError> {
        let deadline = Instant::now() + total;
        loop {
            self.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}
