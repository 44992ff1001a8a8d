//! Key lifecycle engine
//!
//! Tracks each private key through Generated, Published, Ready, Active,
//! Retired, Revoked and Removed, with the timing constraints of RFC 6781,
//! RFC 7583 and RFC 5011. A periodic timer computes the set of due
//! transitions under the registry lock and the zone applies them after the
//! lock is released, since every applied action commits and may NOTIFY.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{Builder, JoinHandle};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::dns::dnssec::{DnssecKey, KeyState, KeyType};
use crate::dns::errors::{ZoneError, ZoneResult};

/// Delay before the first tick after signing or startup.
pub const FIRST_TICK: StdDuration = StdDuration::from_secs(30);
/// Cadence of all subsequent ticks.
pub const TICK_INTERVAL: StdDuration = StdDuration::from_secs(15 * 60);
/// Attempts to generate a key with an unused tag before giving up.
pub const TAG_COLLISION_RETRIES: usize = 5;

/// The per-zone key set. Tags are unique among live keys; a key is only
/// removable while still Generated.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyRegistry {
    keys: Vec<DnssecKey>,
}

impl KeyRegistry {
    pub fn new() -> KeyRegistry {
        KeyRegistry::default()
    }

    pub fn keys(&self) -> &[DnssecKey] {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut [DnssecKey] {
        &mut self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn contains_tag(&self, tag: u16) -> bool {
        self.keys.iter().any(|k| k.key_tag == tag)
    }

    pub fn get(&self, tag: u16) -> Option<&DnssecKey> {
        self.keys.iter().find(|k| k.key_tag == tag)
    }

    pub fn get_mut(&mut self, tag: u16) -> Option<&mut DnssecKey> {
        self.keys.iter_mut().find(|k| k.key_tag == tag)
    }

    /// Insert a key whose tag must not collide with a live key.
    pub fn insert(&mut self, zone: &str, key: DnssecKey) -> ZoneResult<()> {
        if self.contains_tag(key.key_tag) {
            return Err(ZoneError::TagCollision {
                zone: zone.to_string(),
            });
        }
        self.keys.push(key);
        Ok(())
    }

    pub fn remove(&mut self, tag: u16) -> Option<DnssecKey> {
        let idx = self.keys.iter().position(|k| k.key_tag == tag)?;
        Some(self.keys.remove(idx))
    }

    /// A clone of the key set for use as a signing snapshot outside the
    /// registry lock.
    pub fn snapshot(&self) -> Vec<DnssecKey> {
        self.keys.clone()
    }
}

/// A transition the tick decided is due. Actions are applied by the zone
/// after the registry lock is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Published key has outlived the DNSKEY TTL in caches.
    MakeReady(u16),
    /// Ready key may start signing (ZSK: hold expired; KSK: DS observed).
    Activate(u16),
    /// Retiring key has a safe successor.
    Retire(u16),
    /// Retired KSK gets the RFC 5011 revoke bit.
    Revoke(u16),
    /// Key leaves the zone; its RRSIGs (ZSK) or DNSKEY (KSK) go with it.
    Remove(u16),
    /// Active ZSK outlived its rollover age; generate a successor.
    Rollover(u16),
}

/// Whether `key` may leave Active for Retired.
///
/// A KSK needs another same-algorithm KSK that is Active and not itself
/// retiring; two Ready KSKs are also acceptable. A ZSK strictly needs an
/// Active successor, because nothing else can sign the zone data.
pub fn retire_is_safe(registry: &KeyRegistry, key: &DnssecKey) -> bool {
    registry.keys().iter().any(|candidate| {
        candidate.key_tag != key.key_tag
            && candidate.key_type == key.key_type
            && candidate.algorithm == key.algorithm
            && !candidate.is_retiring
            && match key.key_type {
                KeyType::KSK => {
                    candidate.state == KeyState::Active
                        || (key.state == KeyState::Ready && candidate.state == KeyState::Ready)
                }
                KeyType::ZSK => candidate.state == KeyState::Active,
            }
    })
}

/// RFC 7583 section 3.3.4: how long a revoked key stays published.
pub fn revoke_hold(dnskey_ttl: u32) -> Duration {
    let half_ttl = Duration::seconds(i64::from(dnskey_ttl / 2));
    let floor = Duration::hours(1);
    let ceiling = Duration::days(15);
    half_ttl.max(floor).min(ceiling)
}

/// Compute the transitions due at `now`.
///
/// `observed_ds` is the key-tag set seen at the parent, gathered outside
/// all locks; None means the lookup did not run (or failed) this tick, so
/// no KSK is activated on its basis.
pub fn due_actions(
    registry: &KeyRegistry,
    now: DateTime<Utc>,
    dnskey_ttl: u32,
    observed_ds: Option<&[u16]>,
) -> Vec<LifecycleAction> {
    let ttl = Duration::seconds(i64::from(dnskey_ttl));
    let mut actions = Vec::new();

    for key in registry.keys() {
        let age = now - key.state_changed_at;
        match key.state {
            KeyState::Published => {
                if age > ttl {
                    actions.push(LifecycleAction::MakeReady(key.key_tag));
                }
            }
            KeyState::Ready => {
                if key.is_retiring {
                    // A key flagged before ever activating retires directly
                    // (for KSKs this is the both-Ready case).
                    if retire_is_safe(registry, key) {
                        actions.push(LifecycleAction::Retire(key.key_tag));
                    }
                } else {
                    match key.key_type {
                        KeyType::ZSK => actions.push(LifecycleAction::Activate(key.key_tag)),
                        KeyType::KSK => {
                            if let Some(tags) = observed_ds {
                                if tags.contains(&key.key_tag) {
                                    actions.push(LifecycleAction::Activate(key.key_tag));
                                }
                            }
                        }
                    }
                }
            }
            KeyState::Active => {
                if key.is_retiring {
                    if retire_is_safe(registry, key) {
                        actions.push(LifecycleAction::Retire(key.key_tag));
                    }
                } else if key.key_type == KeyType::ZSK
                    && key.rollover_days > 0
                    && age > Duration::days(i64::from(key.rollover_days))
                {
                    actions.push(LifecycleAction::Rollover(key.key_tag));
                }
            }
            KeyState::Retired => {
                if age > ttl {
                    match key.key_type {
                        KeyType::KSK => actions.push(LifecycleAction::Revoke(key.key_tag)),
                        KeyType::ZSK => actions.push(LifecycleAction::Remove(key.key_tag)),
                    }
                }
            }
            KeyState::Revoked => {
                if age > revoke_hold(dnskey_ttl) {
                    actions.push(LifecycleAction::Remove(key.key_tag));
                }
            }
            KeyState::Generated | KeyState::Removed => {}
        }
    }

    actions
}

/// Refresh predicate for the signature sweep: an RRSIG is renewed once
/// less than half of its inception-to-expiration window remains.
pub fn rrsig_needs_refresh(inception: u32, expiration: u32, now: DateTime<Utc>) -> bool {
    let now_ts = now.timestamp();
    let midpoint = (i64::from(inception) + i64::from(expiration)) / 2;
    now_ts >= midpoint
}

/// The single-shot rescheduling timer driving the lifecycle.
///
/// A named worker thread waits on a cancellation channel with a timeout:
/// the timeout firing is the tick. The callback runs on the worker, so it
/// must take its own locks and never block on the caller.
pub struct LifecycleTimer {
    cancel: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LifecycleTimer {
    pub fn start<F>(zone: &str, tick: F) -> LifecycleTimer
    where
        F: Fn() + Send + 'static,
    {
        let (cancel, signal) = mpsc::channel();
        let thread_zone = zone.to_string();

        let handle = Builder::new()
            .name(format!("dnssec-timer-{}", zone))
            .spawn(move || {
                let mut wait = FIRST_TICK;
                loop {
                    match signal.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!("dnssec timer for {} cancelled", thread_zone);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            tick();
                            wait = TICK_INTERVAL;
                        }
                    }
                }
            })
            .expect("failed to spawn dnssec timer thread");

        LifecycleTimer {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the timer and wait for the worker to exit.
    pub fn cancel(mut self) {
        let _ = self.cancel.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LifecycleTimer {
    fn drop(&mut self) {
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::dnssec::DnssecAlgorithm;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn key_in_state(
        key_type: KeyType,
        state: KeyState,
        changed_at: DateTime<Utc>,
        retiring: bool,
    ) -> DnssecKey {
        let mut key =
            DnssecKey::generate(key_type, DnssecAlgorithm::EcdsaP256Sha256, 90, changed_at)
                .unwrap();
        key.transition(state, changed_at);
        key.is_retiring = retiring;
        key
    }

    #[test]
    fn test_published_to_ready_after_ttl() {
        let mut registry = KeyRegistry::new();
        let ttl = 86400u32;

        let fresh = key_in_state(KeyType::ZSK, KeyState::Published, now(), false);
        let stale = key_in_state(
            KeyType::ZSK,
            KeyState::Published,
            now() - Duration::seconds(i64::from(ttl) + 1),
            false,
        );
        let stale_tag = stale.key_tag;
        registry.insert("example.com", fresh).unwrap();
        registry.insert("example.com", stale).unwrap();

        let actions = due_actions(&registry, now(), ttl, None);
        assert_eq!(actions, vec![LifecycleAction::MakeReady(stale_tag)]);
    }

    #[test]
    fn test_ready_zsk_activates_ready_ksk_waits_for_ds() {
        let mut registry = KeyRegistry::new();
        let zsk = key_in_state(KeyType::ZSK, KeyState::Ready, now(), false);
        let ksk = key_in_state(KeyType::KSK, KeyState::Ready, now(), false);
        let zsk_tag = zsk.key_tag;
        let ksk_tag = ksk.key_tag;
        registry.insert("example.com", zsk).unwrap();
        registry.insert("example.com", ksk).unwrap();

        // Without a DS observation only the ZSK moves.
        let actions = due_actions(&registry, now(), 86400, None);
        assert_eq!(actions, vec![LifecycleAction::Activate(zsk_tag)]);

        // With the tag observed at the parent, the KSK follows.
        let observed = vec![ksk_tag];
        let actions = due_actions(&registry, now(), 86400, Some(&observed));
        assert!(actions.contains(&LifecycleAction::Activate(ksk_tag)));
    }

    #[test]
    fn test_retire_requires_safe_successor() {
        let mut registry = KeyRegistry::new();
        let old = key_in_state(KeyType::ZSK, KeyState::Active, now(), true);
        let old_tag = old.key_tag;
        registry.insert("example.com", old).unwrap();

        // No successor at all: nothing happens.
        assert!(due_actions(&registry, now(), 86400, None).is_empty());

        // A successor still in Published is not enough for a ZSK.
        let published = key_in_state(KeyType::ZSK, KeyState::Published, now(), false);
        registry.insert("example.com", published).unwrap();
        assert!(due_actions(&registry, now(), 86400, None).is_empty());

        // An Active successor unlocks the retirement.
        let active = key_in_state(KeyType::ZSK, KeyState::Active, now(), false);
        registry.insert("example.com", active).unwrap();
        let actions = due_actions(&registry, now(), 86400, None);
        assert!(actions.contains(&LifecycleAction::Retire(old_tag)));
    }

    #[test]
    fn test_ksk_both_ready_counts_as_safe() {
        let mut registry = KeyRegistry::new();
        let mut old = key_in_state(KeyType::KSK, KeyState::Ready, now(), true);
        old.is_retiring = true;
        let successor = key_in_state(KeyType::KSK, KeyState::Ready, now(), false);
        let old_clone = old.clone();
        registry.insert("example.com", old).unwrap();
        registry.insert("example.com", successor).unwrap();

        assert!(retire_is_safe(&registry, &old_clone));
    }

    #[test]
    fn test_zsk_rollover_when_overage() {
        let mut registry = KeyRegistry::new();
        let aged = key_in_state(
            KeyType::ZSK,
            KeyState::Active,
            now() - Duration::days(91),
            false,
        );
        let tag = aged.key_tag;
        registry.insert("example.com", aged).unwrap();

        let actions = due_actions(&registry, now(), 86400, None);
        assert_eq!(actions, vec![LifecycleAction::Rollover(tag)]);
    }

    #[test]
    fn test_retired_and_revoked_progressions() {
        let ttl = 86400u32;
        let past_ttl = now() - Duration::seconds(i64::from(ttl) + 1);

        let mut registry = KeyRegistry::new();
        let ksk = key_in_state(KeyType::KSK, KeyState::Retired, past_ttl, false);
        let zsk = key_in_state(KeyType::ZSK, KeyState::Retired, past_ttl, false);
        let ksk_tag = ksk.key_tag;
        let zsk_tag = zsk.key_tag;
        registry.insert("example.com", ksk).unwrap();
        registry.insert("example.com", zsk).unwrap();

        let actions = due_actions(&registry, now(), ttl, None);
        assert!(actions.contains(&LifecycleAction::Revoke(ksk_tag)));
        assert!(actions.contains(&LifecycleAction::Remove(zsk_tag)));

        // A revoked key is removed after max(1h, min(15d, ttl/2)).
        let mut registry = KeyRegistry::new();
        let hold = revoke_hold(ttl);
        let revoked = key_in_state(
            KeyType::KSK,
            KeyState::Revoked,
            now() - hold - Duration::seconds(1),
            false,
        );
        let tag = revoked.key_tag;
        registry.insert("example.com", revoked).unwrap();
        let actions = due_actions(&registry, now(), ttl, None);
        assert_eq!(actions, vec![LifecycleAction::Remove(tag)]);
    }

    #[test]
    fn test_revoke_hold_bounds() {
        assert_eq!(revoke_hold(3600), Duration::hours(1));
        assert_eq!(revoke_hold(86400), Duration::seconds(43200));
        assert_eq!(revoke_hold(u32::MAX), Duration::days(15));
    }

    #[test]
    fn test_rrsig_refresh_predicate() {
        let inception = (now() - Duration::days(10)).timestamp() as u32;

        // More than half the window left: no refresh.
        let expiration = (now() + Duration::days(11)).timestamp() as u32;
        assert!(!rrsig_needs_refresh(inception, expiration, now()));

        // Less than half left: refresh.
        let expiration = (now() + Duration::days(9)).timestamp() as u32;
        assert!(rrsig_needs_refresh(inception, expiration, now()));
    }

    #[test]
    fn test_timer_cancels_cleanly() {
        let timer = LifecycleTimer::start("example.com", || {});
        timer.cancel();
    }
}
