//! In-memory summary cache with single-flight execution claims.
//!
//! The cache maps a *fingerprint* — the exact raw bytes of an inbound request
//! body — to the [`ResponseSummary`] computed for it. Entries live for the
//! process lifetime and are write-once in the orchestrated flow: the first
//! caller to claim a fingerprint executes the outbound call, everyone else
//! waits for that one result.
//!
//! Plain `lookup`/`store` alone would leave a window where N identical
//! concurrent requests all miss and all dial upstream. [`SummaryCache::begin`]
//! closes it: claiming a fingerprint and observing an existing claim are one
//! atomic map operation, so for any fingerprint at most one
//! [`FlightClaim`] exists at a time. Claimants publish their outcome over a
//! broadcast channel; a claim dropped without settling (panic, cancellation)
//! removes itself so waiters can re-arbitrate instead of stalling forever.
//!
//! No lock is ever held across the outbound call — a claim is a map entry,
//! not a guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::relay::summary::ResponseSummary;

/// The cache key: an inbound request body, byte for byte.
///
/// Matching is byte-exact, never semantic: equivalent JSON with different
/// whitespace or field order is a different fingerprint.
pub type Fingerprint = Bytes;

/// What a finished flight publishes to its waiters.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// The outbound call succeeded; the summary is also in the cache now.
    Completed(Arc<ResponseSummary>),
    /// The outbound call failed; the rendered error, identical for every waiter.
    Failed(String),
}

/// A cache slot: either a completed summary or an in-flight claim.
enum Slot {
    Ready(Arc<ResponseSummary>),
    Pending(broadcast::Sender<FlightOutcome>),
}

/// Result of [`SummaryCache::begin`] for a fingerprint.
pub enum Flight<'a> {
    /// A completed summary already exists.
    Hit(Arc<ResponseSummary>),
    /// This caller won the claim and must execute the outbound call.
    Claimed(FlightClaim<'a>),
    /// Another caller is executing; await its published outcome.
    Pending(broadcast::Receiver<FlightOutcome>),
}

/// An exclusive claim on a fingerprint, held while the outbound call runs.
///
/// Settle it with [`complete`](Self::complete) or [`abort`](Self::abort).
/// Dropping an unsettled claim removes the pending slot, closing the waiters'
/// channel so they re-enter [`SummaryCache::begin`].
pub struct FlightClaim<'a> {
    cache: &'a SummaryCache,
    fingerprint: Fingerprint,
    sender: broadcast::Sender<FlightOutcome>,
    settled: bool,
}

impl FlightClaim<'_> {
    /// Stores the summary under the claimed fingerprint and publishes it to
    /// all waiters. Returns the shared summary for the claimant's own reply.
    pub fn complete(mut self, summary: ResponseSummary) -> Arc<ResponseSummary> {
        let summary = Arc::new(summary);
        self.cache
            .store(self.fingerprint.clone(), Arc::clone(&summary));
        // Send errors just mean nobody was waiting.
        let _ = self
            .sender
            .send(FlightOutcome::Completed(Arc::clone(&summary)));
        self.settled = true;
        summary
    }

    /// Removes the claim without storing anything and publishes the failure.
    ///
    /// The fingerprint ends up absent, so a later identical request executes
    /// the outbound call again; only the waiters concurrent with this flight
    /// share its failure.
    pub fn abort(mut self, message: &str) {
        self.cache.clear_pending(&self.fingerprint);
        let _ = self.sender.send(FlightOutcome::Failed(message.to_owned()));
        self.settled = true;
    }
}

impl Drop for FlightClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.clear_pending(&self.fingerprint);
        }
    }
}

/// Concurrency-safe fingerprint → summary cache plus the identifier counter.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use relayd::cache::{Flight, SummaryCache};
/// use relayd::relay::summary::ResponseSummary;
///
/// let cache = SummaryCache::new();
/// let fingerprint = Bytes::from_static(b"{\"method\":\"GET\",\"url\":\"http://x/\"}");
///
/// let Flight::Claimed(claim) = cache.begin(fingerprint.clone()) else {
///     unreachable!("first caller always claims");
/// };
/// let summary = ResponseSummary {
///     id: cache.allocate_id(),
///     status: 200,
///     headers: Default::default(),
///     length: -1,
/// };
/// claim.complete(summary);
///
/// assert!(cache.lookup(&fingerprint).is_some());
/// ```
pub struct SummaryCache {
    slots: DashMap<Fingerprint, Slot>,
    next_id: AtomicU64,
}

impl SummaryCache {
    /// Creates an empty cache with the identifier counter at 1.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Read-only lookup. A pending claim reads as absent: absence means
    /// "never successfully completed", not "not in flight".
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<ResponseSummary>> {
        match self.slots.get(fingerprint)?.value() {
            Slot::Ready(summary) => Some(Arc::clone(summary)),
            Slot::Pending(_) => None,
        }
    }

    /// Inserts unconditionally; an existing entry for the fingerprint is
    /// overwritten (last-writer-wins, no uniqueness check at store time).
    pub fn store(&self, fingerprint: Fingerprint, summary: Arc<ResponseSummary>) {
        self.slots.insert(fingerprint, Slot::Ready(summary));
    }

    /// Atomic get-or-claim for a fingerprint.
    ///
    /// Exactly one of three things happens, decided under the slot's entry
    /// lock: a completed summary is returned ([`Flight::Hit`]), a live claim
    /// is observed and subscribed to ([`Flight::Pending`] — subscribing under
    /// the lock means the claimant's later send cannot be missed), or the
    /// caller installs the claim ([`Flight::Claimed`]).
    pub fn begin(&self, fingerprint: Fingerprint) -> Flight<'_> {
        match self.slots.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(summary) => Flight::Hit(Arc::clone(summary)),
                Slot::Pending(sender) => Flight::Pending(sender.subscribe()),
            },
            Entry::Vacant(entry) => {
                let (sender, _) = broadcast::channel(1);
                entry.insert(Slot::Pending(sender.clone()));
                Flight::Claimed(FlightClaim {
                    cache: self,
                    fingerprint,
                    sender,
                    settled: false,
                })
            }
        }
    }

    /// Allocates the next identifier: a decimal string from a monotonic
    /// atomic counter starting at "1". Independent of cache population, so
    /// identifiers stay unique without any lock discipline around the map.
    pub fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Removes the slot only if it is still a pending claim.
    ///
    /// While a claim is live no other writer can replace its slot, so
    /// matching on the variant is exact — a `Ready` slot is never removed.
    fn clear_pending(&self, fingerprint: &Fingerprint) {
        self.slots
            .remove_if(fingerprint, |_, slot| matches!(slot, Slot::Pending(_)));
    }
}

impl Default for SummaryCache {
    fn default() -> Self {
        Self::new()
    }
}
