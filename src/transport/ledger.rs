//! Outstanding-packet ledger.
//!
//! Map from sequence number to the sealed wire bytes of every packet sent but
//! not yet acknowledged. `send()` inserts, the retransmit loop reads, and the
//! acknowledgment listener removes.
//!
//! One mutex guards the map. Readers copy entries out under the lock and
//! perform network I/O after releasing it, so concurrent inserts never wait
//! on a socket.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::core::{HEADER_SIZE, NONCE_SIZE};

/// An unacknowledged packet.
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    /// Sealed wire bytes, resent verbatim.
    pub bytes: Bytes,
    /// When the packet was first queued.
    pub first_sent: Instant,
    /// When the packet was last handed to the socket.
    pub last_sent: Instant,
    /// Number of transmissions so far, including the first.
    pub transmissions: u32,
}

impl OutstandingPacket {
    fn new(bytes: Bytes, now: Instant) -> Self {
        Self {
            bytes,
            first_sent: now,
            last_sent: now,
            transmissions: 1,
        }
    }

    /// Nonce of the stored frame, if it is long enough to carry one.
    pub fn nonce(&self) -> Option<&[u8]> {
        self.bytes.get(HEADER_SIZE - NONCE_SIZE..HEADER_SIZE)
    }

    /// Time at which this packet is next due for resend.
    pub fn due_at(&self, interval: Duration) -> Instant {
        self.last_sent + interval
    }
}

/// Result of collecting due packets.
#[derive(Debug, Default)]
pub struct DueBatch {
    /// Packets to resend now, in sequence order.
    pub resend: Vec<(u32, Bytes)>,
    /// Sequences dropped because they exhausted their transmission budget.
    pub abandoned: Vec<u32>,
}

/// Concurrent ledger of unacknowledged packets.
#[derive(Debug, Default)]
pub struct OutstandingLedger {
    entries: Mutex<HashMap<u32, OutstandingPacket>>,
}

impl OutstandingLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, OutstandingPacket>> {
        // No invariant spans more than one map operation, so a poisoned map is still valid.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a packet that has just been sent for the first time.
    ///
    /// A previous entry under the same sequence (after 2^32 sends) is replaced.
    pub fn insert(&self, sequence: u32, bytes: Bytes) {
        self.insert_at(sequence, bytes, Instant::now());
    }

    fn insert_at(&self, sequence: u32, bytes: Bytes, now: Instant) {
        self.lock()
            .insert(sequence, OutstandingPacket::new(bytes, now));
    }

    /// Drop an entry. Returns `true` if it was present.
    pub fn remove(&self, sequence: u32) -> bool {
        self.lock().remove(&sequence).is_some()
    }

    /// Drop an entry only if its stored frame was sealed with `nonce`.
    ///
    /// Returns `true` if an entry was removed. A sequence reused after a
    /// restart carries a different nonce, so a stale acknowledgment for it
    /// leaves the entry in place.
    pub fn acknowledge(&self, sequence: u32, nonce: &[u8; NONCE_SIZE]) -> bool {
        let mut entries = self.lock();
        let matches = entries
            .get(&sequence)
            .is_some_and(|entry| entry.nonce() == Some(nonce.as_slice()));
        if matches {
            entries.remove(&sequence);
        }
        matches
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of outstanding packets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `sequence` is outstanding.
    pub fn contains(&self, sequence: u32) -> bool {
        self.lock().contains_key(&sequence)
    }

    /// Sorted list of outstanding sequence numbers.
    pub fn sequences(&self) -> Vec<u32> {
        let mut sequences: Vec<u32> = self.lock().keys().copied().collect();
        sequences.sort_unstable();
        sequences
    }

    /// Visit a snapshot of all entries.
    ///
    /// The snapshot is taken under the lock; `visitor` runs after it is
    /// released and may call back into the ledger.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(u32, &OutstandingPacket),
    {
        let snapshot: Vec<(u32, OutstandingPacket)> = {
            let entries = self.lock();
            entries
                .iter()
                .map(|(&seq, entry)| (seq, entry.clone()))
                .collect()
        };

        for (sequence, entry) in &snapshot {
            visitor(*sequence, entry);
        }
    }

    /// Earliest time any entry becomes due, or `None` when empty.
    pub fn next_due(&self, interval: Duration) -> Option<Instant> {
        self.lock()
            .values()
            .map(|entry| entry.due_at(interval))
            .min()
    }

    /// Collect entries due at `now` and mark them as sent.
    ///
    /// This is the retransmit loop's visit over the ledger: like
    /// [`for_each`](Self::for_each) it copies what must be resent while
    /// holding the lock and leaves the network I/O to the caller, but it also
    /// skips entries that are not yet due and updates send bookkeeping in the
    /// same critical section.
    ///
    /// With `max_transmissions` set, entries that already used their budget
    /// are removed instead and reported in [`DueBatch::abandoned`].
    pub fn take_due(
        &self,
        interval: Duration,
        max_transmissions: Option<u32>,
        now: Instant,
    ) -> DueBatch {
        let mut batch = DueBatch::default();
        let mut entries = self.lock();

        entries.retain(|&sequence, entry| {
            if entry.due_at(interval) > now {
                return true;
            }
            if max_transmissions.is_some_and(|max| entry.transmissions >= max) {
                batch.abandoned.push(sequence);
                return false;
            }
            entry.last_sent = now;
            entry.transmissions = entry.transmissions.saturating_add(1);
            batch.resend.push((sequence, entry.bytes.clone()));
            true
        });
        drop(entries);

        batch.resend.sort_unstable_by_key(|(sequence, _)| *sequence);
        batch.abandoned.sort_unstable();
        batch
    }
}
