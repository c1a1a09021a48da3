//! Sponsor Pool
//!
//! Fixed set of fee-paying intermediary identities, each guarded by an
//! atomic busy flag. A sponsor is handed out as a [`SponsorLease`]; dropping
//! the lease releases the sponsor, so every exit path of a pipeline run
//! (including a panic unwinding through it) gives the sponsor back.

use crate::keys::Keypair;
use crate::types::{PipelinePhase, PublicKey, SponsorStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Activity {
    phase: Option<PipelinePhase>,
    wallet_public_key: Option<PublicKey>,
}

#[derive(Debug)]
pub struct Sponsor {
    keypair: Keypair,
    busy: AtomicBool,
    activity: Mutex<Activity>,
}

impl Sponsor {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            busy: AtomicBool::new(false),
            activity: Mutex::new(Activity::default()),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> &str {
        self.keypair.public_key()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_mark_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_idle(&self) {
        *self.activity.lock() = Activity::default();
        self.busy.store(false, Ordering::Release);
    }

    fn status(&self) -> SponsorStatus {
        let activity = self.activity.lock().clone();
        SponsorStatus {
            public_key: self.public_key().to_string(),
            busy: self.is_busy(),
            phase: activity.phase,
            wallet_public_key: activity.wallet_public_key,
        }
    }
}

pub struct SponsorPool {
    sponsors: Vec<Arc<Sponsor>>,
}

impl SponsorPool {
    /// Build a pool; repeated identities are kept once so no two entries
    /// share a public key.
    pub fn new(keypairs: Vec<Keypair>) -> Self {
        let mut sponsors: Vec<Arc<Sponsor>> = Vec::with_capacity(keypairs.len());
        for keypair in keypairs {
            if sponsors
                .iter()
                .any(|s| s.public_key() == keypair.public_key())
            {
                debug!("Skipping duplicate sponsor {}", keypair.public_key());
                continue;
            }
            sponsors.push(Arc::new(Sponsor::new(keypair)));
        }
        Self { sponsors }
    }

    pub fn len(&self) -> usize {
        self.sponsors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sponsors.is_empty()
    }

    pub fn list_available(&self) -> Vec<Arc<Sponsor>> {
        self.sponsors
            .iter()
            .filter(|s| !s.is_busy())
            .cloned()
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.sponsors.iter().filter(|s| s.is_busy()).count()
    }

    /// Flip the sponsor to busy. Returns `None` when another caller got there
    /// first.
    pub fn try_acquire(&self, sponsor: &Arc<Sponsor>) -> Option<SponsorLease> {
        if !sponsor.try_mark_busy() {
            return None;
        }
        debug!("Sponsor {} acquired", sponsor.public_key());
        Some(SponsorLease {
            sponsor: Arc::clone(sponsor),
        })
    }

    /// First sponsor that can be acquired right now.
    pub fn acquire_any(&self) -> Option<SponsorLease> {
        self.sponsors.iter().find_map(|s| self.try_acquire(s))
    }

    /// Idempotent: releasing an idle sponsor is a no-op.
    pub fn release(sponsor: &Sponsor) {
        sponsor.mark_idle();
    }

    pub fn find(&self, public_key: &str) -> Option<Arc<Sponsor>> {
        self.sponsors
            .iter()
            .find(|s| s.public_key() == public_key)
            .cloned()
    }

    pub fn statuses(&self) -> Vec<SponsorStatus> {
        self.sponsors.iter().map(|s| s.status()).collect()
    }
}

/// Exclusive hold on one sponsor.
pub struct SponsorLease {
    sponsor: Arc<Sponsor>,
}

impl SponsorLease {
    pub fn sponsor(&self) -> &Sponsor {
        &self.sponsor
    }

    pub fn keypair(&self) -> &Keypair {
        self.sponsor.keypair()
    }

    pub fn public_key(&self) -> &str {
        self.sponsor.public_key()
    }

    pub fn bind_wallet(&self, wallet_public_key: Option<PublicKey>) {
        self.sponsor.activity.lock().wallet_public_key = wallet_public_key;
    }

    pub fn set_phase(&self, phase: PipelinePhase) {
        self.sponsor.activity.lock().phase = Some(phase);
    }

    /// Release now rather than at drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SponsorLease {
    fn drop(&mut self) {
        SponsorPool::release(&self.sponsor);
        debug!("Sponsor {} released", self.sponsor.public_key());
    }
}
