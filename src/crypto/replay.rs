//! Anti-replay protection
//!
//! Sequence numbers are authenticated (they are part of the AAD), so a
//! replayed datagram carries exactly the sequence and timestamp it was sealed
//! with. Each window (one for all sources by default, see [`ReplayScope`])
//! applies:
//! - Above highest: accept and advance the window, unless sealed before the
//!   newest accepted packet (left over from before a restart)
//! - Inside the window or at/below its floor with a timestamp newer than
//!   every timestamp accepted so far: the peer restarted its counter, so the
//!   window starts over at this packet
//! - Inside the window otherwise: accept an unseen slot once, unless it was
//!   sealed before the last restart; reject repeats
//! - At or below the floor otherwise: reject
//!
//! Sequence numbers wrap at 2^32 and are compared with serial-number
//! arithmetic (RFC 1982).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::core::{DEFAULT_MAX_PEERS, REPLAY_WINDOW_SIZE, ReplayError};

const WINDOW_WORDS: usize = REPLAY_WINDOW_SIZE / 64;

/// Position of a sequence number relative to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// Newer than the highest sequence, by this many steps.
    Ahead(u32),
    /// Inside the window, this many steps behind the highest sequence.
    Inside(u32),
    /// At or below the window floor.
    Below,
}

/// What accepting a packet does to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// First packet ever seen.
    Start,
    /// Newer than the highest sequence, by this many steps.
    Advance(u32),
    /// Fills an unseen slot this many steps behind the highest sequence.
    Fill(u32),
    /// The peer restarted its counter; the window starts over.
    Restart,
}

/// Sliding bitmap window over wrapping `u32` sequence numbers.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Bit `i` set means `highest - i` has been accepted
    bitmap: [u64; WINDOW_WORDS],
    /// Highest sequence accepted so far
    highest: u32,
    /// Newest timestamp accepted so far
    latest_timestamp: u64,
    /// Newest timestamp of the run that preceded the last restart
    run_floor: Option<u64>,
    /// Whether any packet has been accepted yet
    initialized: bool,
}

impl ReplayWindow {
    /// Create a new, empty replay window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; WINDOW_WORDS],
            highest: 0,
            latest_timestamp: 0,
            run_floor: None,
            initialized: false,
        }
    }

    /// Highest accepted sequence, if any.
    pub fn highest(&self) -> Option<u32> {
        self.initialized.then_some(self.highest)
    }

    fn position(&self, sequence: u32) -> Position {
        let ahead = sequence.wrapping_sub(self.highest);
        if ahead != 0 && ahead < 1 << 31 {
            return Position::Ahead(ahead);
        }
        let behind = self.highest.wrapping_sub(sequence);
        if (behind as usize) < REPLAY_WINDOW_SIZE {
            Position::Inside(behind)
        } else {
            Position::Below
        }
    }

    fn classify(&self, sequence: u32, timestamp: u64) -> Result<Action, ReplayError> {
        if !self.initialized {
            return Ok(Action::Start);
        }

        match self.position(sequence) {
            // A later sequence is always sealed at or after every earlier one
            Position::Ahead(_) if timestamp < self.latest_timestamp => {
                Err(ReplayError::Stale { sequence })
            }
            Position::Ahead(shift) => Ok(Action::Advance(shift)),
            // Sealed after everything accepted so far: the peer restarted
            Position::Inside(_) | Position::Below if timestamp > self.latest_timestamp => {
                Ok(Action::Restart)
            }
            Position::Inside(behind) if self.is_marked(behind) => {
                Err(ReplayError::Duplicate { sequence })
            }
            // An unseen slot from a run that ended before the last restart
            Position::Inside(_) if self.run_floor.is_some_and(|floor| timestamp <= floor) => {
                Err(ReplayError::Stale { sequence })
            }
            Position::Inside(behind) => Ok(Action::Fill(behind)),
            Position::Below => Err(ReplayError::BelowWindow { sequence }),
        }
    }

    /// Check a packet without updating the window.
    pub fn check(&self, sequence: u32, timestamp: u64) -> Result<(), ReplayError> {
        self.classify(sequence, timestamp).map(|_| ())
    }

    /// Check a packet and record it as accepted.
    ///
    /// Only call this after the packet's tag has been verified.
    pub fn check_and_update(&mut self, sequence: u32, timestamp: u64) -> Result<(), ReplayError> {
        match self.classify(sequence, timestamp)? {
            Action::Start => self.restart_at(sequence, timestamp),
            Action::Advance(shift) => {
                self.shift_window(shift);
                self.highest = sequence;
                self.mark(0);
                self.latest_timestamp = timestamp;
            }
            Action::Fill(behind) => self.mark(behind),
            Action::Restart => {
                self.run_floor = Some(self.latest_timestamp);
                self.restart_at(sequence, timestamp);
            }
        }
        Ok(())
    }

    /// Reset the window so that `sequence` is its only accepted entry.
    fn restart_at(&mut self, sequence: u32, timestamp: u64) {
        self.bitmap = [0; WINDOW_WORDS];
        self.highest = sequence;
        self.latest_timestamp = timestamp;
        self.initialized = true;
        self.mark(0);
    }

    fn is_marked(&self, behind: u32) -> bool {
        let bit_index = behind as usize;
        (self.bitmap[bit_index / 64] & (1 << (bit_index % 64))) != 0
    }

    fn mark(&mut self, behind: u32) {
        let bit_index = behind as usize;
        self.bitmap[bit_index / 64] |= 1 << (bit_index % 64);
    }

    /// Shift the window forward.
    ///
    /// Bit position represents (highest - sequence), so older sequences move
    /// to higher bit positions.
    fn shift_window(&mut self, shift: u32) {
        if shift as usize >= REPLAY_WINDOW_SIZE {
            self.bitmap = [0; WINDOW_WORDS];
            return;
        }

        let shift_words = shift as usize / 64;
        let shift_bits = shift % 64;

        if shift_words > 0 {
            for i in (shift_words..WINDOW_WORDS).rev() {
                self.bitmap[i] = self.bitmap[i - shift_words];
            }
            for word in self.bitmap.iter_mut().take(shift_words) {
                *word = 0;
            }
        }

        if shift_bits > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let new_carry = *word >> (64 - shift_bits);
                *word = (*word << shift_bits) | carry;
                carry = new_carry;
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Which packets share a replay window.
///
/// Source addresses are not authenticated. Under [`ReplayScope::PerSource`] a
/// captured packet re-sent from another address lands in a fresh window and is
/// accepted again, and a flood of spoofed sources can evict a genuine peer's
/// window. Only opt into it when every peer holds its own key or replays
/// across addresses are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayScope {
    /// A single window for every source.
    #[default]
    Shared,
    /// One window per source address. Spoofable; see the type docs.
    PerSource,
}

/// Replay defense configuration.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Window scope.
    pub scope: ReplayScope,
    /// Maximum number of tracked sources under [`ReplayScope::PerSource`];
    /// the least recently active is evicted.
    pub max_peers: usize,
    /// Reject packets whose timestamp is older than this (requires loosely
    /// synchronized clocks). `None` disables the check.
    pub max_packet_age: Option<Duration>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            scope: ReplayScope::Shared,
            max_peers: DEFAULT_MAX_PEERS,
            max_packet_age: None,
        }
    }
}

struct PeerWindow {
    window: ReplayWindow,
    last_active: Instant,
}

/// Replay windows keyed by source according to a [`ReplayScope`].
pub struct ReplayGuard {
    config: ReplayConfig,
    windows: HashMap<Option<SocketAddr>, PeerWindow>,
}

impl ReplayGuard {
    /// Create a guard with the given configuration.
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Number of tracked windows.
    pub fn tracked_peers(&self) -> usize {
        self.windows.len()
    }

    fn key(&self, source: SocketAddr) -> Option<SocketAddr> {
        match self.config.scope {
            ReplayScope::PerSource => Some(source),
            ReplayScope::Shared => None,
        }
    }

    /// Check a packet without updating any state.
    ///
    /// Cheap, so the receiver runs it before AEAD verification.
    pub fn check(
        &self,
        source: SocketAddr,
        sequence: u32,
        timestamp: u64,
        now_ms: u64,
    ) -> Result<(), ReplayError> {
        if let Some(max_age) = self.config.max_packet_age {
            let age_ms = now_ms.saturating_sub(timestamp);
            if age_ms > max_age.as_millis() as u64 {
                return Err(ReplayError::Expired { sequence, age_ms });
            }
        }

        match self.windows.get(&self.key(source)) {
            Some(peer) => peer.window.check(sequence, timestamp),
            None => Ok(()),
        }
    }

    /// Check a verified packet and record it as accepted.
    pub fn check_and_update(
        &mut self,
        source: SocketAddr,
        sequence: u32,
        timestamp: u64,
        now_ms: u64,
    ) -> Result<(), ReplayError> {
        self.check(source, sequence, timestamp, now_ms)?;

        let key = self.key(source);
        if !self.windows.contains_key(&key) && self.windows.len() >= self.config.max_peers {
            self.evict_least_recent();
        }

        let peer = self.windows.entry(key).or_insert_with(|| PeerWindow {
            window: ReplayWindow::new(),
            last_active: Instant::now(),
        });
        peer.window.check_and_update(sequence, timestamp)?;
        peer.last_active = Instant::now();
        Ok(())
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .windows
            .iter()
            .min_by_key(|(_, peer)| peer.last_active)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            tracing::debug!(peer = ?key, "evicting replay window");
            self.windows.remove(&key);
        }
    }
}
