//! Transient peer blacklist with exponential cool-off.
//!
//! Failed link attempts park a peer for `entry_lifetime` plus a
//! randomized multiple (1.0 to 1.5) of a per-entry interval that doubles
//! on every further failure, up to a cap.  Contact during the cool-off
//! tail refreshes the entry instead of rejecting, and success removes it
//! outright.  A randomized purge window keeps the table from pinning at
//! its capacity by evicting the shortest-lived entries.

use heapless::Vec;
use meshcore_lib::{CriticalCell, CriticalSection, Lfsr64};

/// Hard capacity of the entry store.
pub const BLACKLIST_CAPACITY: usize = 64;

/// Tunable parameters; all times in blacklist ticks (host-chosen, one
/// second by convention).
#[derive(Clone, Copy, Debug)]
pub struct BlacklistParams {
    pub entry_lifetime: u16,
    pub timer_max_timeout: u16,
    pub timer_timeout: u16,
    pub entry_max_nbr: u16,
    pub purge_nbr: u16,
    pub purge_timer_timeout: u16,
}

impl Default for BlacklistParams {
    fn default() -> Self {
        Self {
            entry_lifetime: 150,
            timer_max_timeout: 600,
            timer_timeout: 30,
            entry_max_nbr: 50,
            purge_nbr: 5,
            purge_timer_timeout: 600,
        }
    }
}

struct BlacklistEntry {
    eui64: [u8; 8],
    ttl: u16,
    interval: u16,
}

struct BlacklistInner {
    entries: Vec<BlacklistEntry, BLACKLIST_CAPACITY>,
    params: BlacklistParams,
    purge_ttl: u16,
    rng: Lfsr64,
}

/// The blacklist service.
pub struct Blacklist {
    inner: CriticalCell<BlacklistInner>,
}

impl Blacklist {
    pub const fn new(cs: &'static CriticalSection) -> Self {
        Self {
            inner: CriticalCell::new(
                cs,
                BlacklistInner {
                    entries: Vec::new(),
                    params: BlacklistParams {
                        entry_lifetime: 150,
                        timer_max_timeout: 600,
                        timer_timeout: 30,
                        entry_max_nbr: 50,
                        purge_nbr: 5,
                        purge_timer_timeout: 600,
                    },
                    purge_ttl: 600,
                    rng: Lfsr64::with_seed(0),
                },
            ),
        }
    }

    /// Seed the cool-off randomization.
    pub fn seed(&self, seed: u64) {
        self.inner.with(|inner| inner.rng = Lfsr64::with_seed(seed));
    }

    pub fn params_set(&self, params: BlacklistParams) {
        self.inner.with(|inner| {
            inner.params = BlacklistParams {
                entry_max_nbr: params.entry_max_nbr.min(BLACKLIST_CAPACITY as u16),
                ..params
            };
            inner.purge_ttl = inner.params.purge_timer_timeout;
        });
    }

    /// Should a link attempt toward this peer be rejected?
    ///
    /// Inside the cool-off head (`ttl > entry_lifetime`) the peer is
    /// rejected; in the tail the contact refreshes the entry to a full
    /// lifetime and is accepted.  A full table rejects unknown peers.
    pub fn reject(&self, eui64: &[u8; 8]) -> bool {
        self.inner.with(|inner| {
            let lifetime = inner.params.entry_lifetime;
            let max = inner.params.entry_max_nbr as usize;
            match inner.entries.iter_mut().find(|e| e.eui64 == *eui64) {
                Some(entry) => {
                    if entry.ttl > lifetime {
                        true
                    } else {
                        entry.ttl = lifetime;
                        false
                    }
                }
                None => inner.entries.len() >= max,
            }
        })
    }

    /// Record the outcome of a link attempt: success removes the entry,
    /// failure adds or escalates it.
    pub fn update(&self, eui64: &[u8; 8], success: bool) {
        self.inner.with(|inner| {
            let position = inner.entries.iter().position(|e| e.eui64 == *eui64);
            if success {
                if let Some(at) = position {
                    inner.entries.swap_remove(at);
                }
                return;
            }
            match position {
                Some(at) => {
                    let params = inner.params;
                    let interval = {
                        let entry = &mut inner.entries[at];
                        entry.interval =
                            (entry.interval.saturating_mul(2)).min(params.timer_max_timeout);
                        entry.interval
                    };
                    let ttl = params.entry_lifetime.saturating_add(
                        inner.rng.randomise_base(interval as u32, 0x8000, 0xC000) as u16,
                    );
                    inner.entries[at].ttl = ttl;
                }
                None => {
                    if inner.entries.len() >= inner.params.entry_max_nbr as usize {
                        return;
                    }
                    let interval = inner.params.timer_timeout;
                    let ttl = inner.params.entry_lifetime.saturating_add(
                        inner.rng.randomise_base(interval as u32, 0x8000, 0xC000) as u16,
                    );
                    let _ = inner.entries.push(BlacklistEntry {
                        eui64: *eui64,
                        ttl,
                        interval,
                    });
                }
            }
        })
    }

    /// Periodic aging; `ticks` have elapsed since the last call.  When
    /// the purge window closes and the table is near capacity, the
    /// shortest-lived entries are evicted.
    pub fn ttl_update(&self, ticks: u16) {
        self.inner.with(|inner| {
            if inner.purge_ttl > ticks {
                inner.purge_ttl -= ticks;
            } else {
                // Next purge 0.5 to 1.5 times the configured window out.
                let timeout = inner.params.purge_timer_timeout;
                inner.purge_ttl =
                    inner.rng.randomise_base(timeout as u32, 0x4000, 0xC000) as u16;

                let cap = inner.params.entry_max_nbr;
                let purge = inner.params.purge_nbr;
                if inner.entries.len() as u16 >= cap.saturating_sub(purge) {
                    for _ in 0..purge {
                        let shortest = inner
                            .entries
                            .iter()
                            .enumerate()
                            .min_by_key(|(_, e)| e.ttl)
                            .map(|(i, _)| i);
                        match shortest {
                            Some(at) => {
                                inner.entries.swap_remove(at);
                            }
                            None => break,
                        }
                    }
                }
            }

            let mut at = 0;
            while at < inner.entries.len() {
                if inner.entries[at].ttl > ticks {
                    inner.entries[at].ttl -= ticks;
                    at += 1;
                } else {
                    inner.entries.swap_remove(at);
                }
            }
        })
    }

    pub fn clear(&self) {
        self.inner.with(|inner| inner.entries.clear());
    }

    pub fn len(&self) -> usize {
        self.inner.with(|inner| inner.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
