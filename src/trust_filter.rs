//! Adaptive per-URL trust filter.
//!
//! Every URL carries a score in `[-10, 10]`. Deeply distrusted URLs are
//! blocked outright, highly trusted ones pass outright, and the band in
//! between is re-verified by fetching the page and scanning it for banned
//! phrases. Moderately trusted URLs skip verification at random with a
//! probability that grows with their score.
//!
//! Scores and the unverifiable set live in LRU maps capped at a fixed number
//! of URLs, so a long-running proxy does not grow without bound. The state
//! lock is never held across a verification fetch; outcomes are applied as a
//! delta to whatever score is current when the fetch returns.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::verifier::{ContentVerifier, Verification};

pub const MIN_TRUST: i8 = -10;
pub const MAX_TRUST: i8 = 10;

/// Scores below this are blocked without verification.
const BLOCK_BELOW: i8 = -5;
/// Scores at or above this pass without verification.
const PASS_FROM: i8 = 5;
/// Skip probability per trust point in the sampled band.
const SKIP_CHANCE_PER_POINT: f64 = 0.2;

pub const DEFAULT_CAPACITY: usize = 65_536;

/// Why the filter reached its decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// A previous verification failed; the URL is no longer checked.
    Unverifiable,
    /// Score is below the block threshold.
    LowTrust,
    /// Score is at or above the pass threshold.
    HighTrust,
    /// Verification skipped by random sampling.
    Sampled,
    /// Verification found no banned phrase.
    Verified,
    /// Verification found the given phrase.
    Banned(String),
    /// Verification could not fetch the page.
    FetchFailed,
}

impl TrustDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, TrustDecision::LowTrust | TrustDecision::Banned(_))
    }
}

struct TrustState {
    scores: LruCache<String, i8>,
    unverifiable: LruCache<String, ()>,
}

impl TrustState {
    fn adjust(&mut self, url: &str, delta: i8) -> i8 {
        let current = self.scores.get(url).copied().unwrap_or(0);
        let updated = current.saturating_add(delta).clamp(MIN_TRUST, MAX_TRUST);
        self.scores.put(url.to_string(), updated);
        updated
    }
}

type Sampler = dyn Fn() -> f64 + Send + Sync;

pub struct TrustFilter {
    state: Mutex<TrustState>,
    verifier: Arc<dyn ContentVerifier>,
    sampler: Box<Sampler>,
}

impl TrustFilter {
    pub fn new(verifier: Arc<dyn ContentVerifier>) -> Self {
        Self::with_capacity(verifier, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(verifier: Arc<dyn ContentVerifier>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(TrustState {
                scores: LruCache::new(capacity),
                unverifiable: LruCache::new(capacity),
            }),
            verifier,
            sampler: Box::new(rand::random::<f64>),
        }
    }

    /// Replaces the uniform `[0, 1)` source used for verification sampling.
    pub fn with_sampler(mut self, sampler: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Decides whether `url` should be blocked, updating its score.
    pub async fn check(&self, url: &str) -> TrustDecision {
        let url = normalize_url(url);

        let trust = {
            let mut state = self.state.lock();

            if state.unverifiable.get(url.as_str()).is_some() {
                debug!("Item bypassed (unable to verify) - [{}]", url);
                return TrustDecision::Unverifiable;
            }

            let trust = match state.scores.get(url.as_str()) {
                Some(score) => *score,
                None => {
                    state.scores.put(url.clone(), 0);
                    0
                }
            };

            if trust < BLOCK_BELOW {
                state.adjust(&url, -1);
                debug!("Trust level {}: failed due to low level - [{}]", trust, url);
                return TrustDecision::LowTrust;
            }

            if trust >= PASS_FROM {
                state.adjust(&url, 1);
                debug!("Trust level {}: bypassed due to high level - [{}]", trust, url);
                return TrustDecision::HighTrust;
            }

            trust
        };

        if trust >= 1 {
            let skip_chance = SKIP_CHANCE_PER_POINT * f64::from(trust);
            if (self.sampler)() < skip_chance {
                debug!(
                    "Trust level {}: bypassed with random check ({:.1}) - [{}]",
                    trust, skip_chance, url
                );
                return TrustDecision::Sampled;
            }
        }

        let verification = self.verifier.verify(&url).await;

        let mut state = self.state.lock();
        match verification {
            Verification::Unverifiable => {
                state.unverifiable.put(url.clone(), ());
                debug!("Trust level {}: unverifiable content - [{}]", trust, url);
                TrustDecision::FetchFailed
            }
            Verification::Clean => {
                let updated = state.adjust(&url, 1);
                debug!(
                    "Trust level {} -> {}: passed with content check - [{}]",
                    trust, updated, url
                );
                TrustDecision::Verified
            }
            Verification::Banned(phrase) => {
                let updated = state.adjust(&url, -1);
                debug!(
                    "Trust level {} -> {}: failed with content check - [{}]",
                    trust, updated, url
                );
                TrustDecision::Banned(phrase)
            }
        }
    }

    /// Current score for `url`, if it has been seen.
    pub fn trust_level(&self, url: &str) -> Option<i8> {
        let url = normalize_url(url);
        self.state.lock().scores.peek(url.as_str()).copied()
    }

    /// Overrides the score for `url`, clamped to the valid range.
    pub fn set_trust_level(&self, url: &str, level: i8) {
        let url = normalize_url(url);
        self.state
            .lock()
            .scores
            .put(url, level.clamp(MIN_TRUST, MAX_TRUST));
    }

    pub fn is_unverifiable(&self, url: &str) -> bool {
        let url = normalize_url(url);
        self.state.lock().unverifiable.contains(url.as_str())
    }

    pub fn tracked_urls(&self) -> usize {
        self.state.lock().scores.len()
    }
}

/// Prefixes `https://` when the URL has no http(s) scheme.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed outcome and counts calls.
    struct FixedVerifier {
        outcome: Verification,
        calls: AtomicUsize,
    }

    impl FixedVerifier {
        fn new(outcome: Verification) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ContentVerifier for FixedVerifier {
        async fn verify(&self, _url: &str) -> Verification {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn never_skip(verifier: Arc<FixedVerifier>) -> TrustFilter {
        TrustFilter::new(verifier).with_sampler(|| 0.999)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.test:443"), "https://example.test:443");
        assert_eq!(normalize_url("http://example.test/page"), "http://example.test/page");
        assert_eq!(normalize_url("https://example.test/"), "https://example.test/");
    }

    #[tokio::test]
    async fn test_clean_verification_raises_trust() {
        let verifier = FixedVerifier::new(Verification::Clean);
        let filter = never_skip(verifier.clone());

        let decision = filter.check("http://example.test/page").await;

        assert_eq!(decision, TrustDecision::Verified);
        assert!(!decision.is_blocked());
        assert_eq!(filter.trust_level("http://example.test/page"), Some(1));
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_banned_verification_blocks_and_lowers_trust() {
        let verifier = FixedVerifier::new(Verification::Banned("casino".into()));
        let filter = never_skip(verifier);

        let decision = filter.check("http://bad.test/").await;

        assert!(decision.is_blocked());
        assert_eq!(filter.trust_level("http://bad.test/"), Some(-1));
    }

    #[tokio::test]
    async fn test_unverifiable_passes_and_is_never_fetched_again() {
        let verifier = FixedVerifier::new(Verification::Unverifiable);
        let filter = never_skip(verifier.clone());

        assert_eq!(filter.check("down.test").await, TrustDecision::FetchFailed);
        assert!(filter.is_unverifiable("down.test"));
        assert_eq!(filter.trust_level("down.test"), Some(0));

        for _ in 0..5 {
            let decision = filter.check("down.test").await;
            assert_eq!(decision, TrustDecision::Unverifiable);
            assert!(!decision.is_blocked());
        }
        assert_eq!(verifier.calls(), 1);
        assert_eq!(filter.trust_level("down.test"), Some(0));
    }

    #[tokio::test]
    async fn test_low_trust_always_blocks_without_fetching() {
        let verifier = FixedVerifier::new(Verification::Clean);
        let filter = TrustFilter::new(verifier.clone()).with_sampler(|| 0.0);
        filter.set_trust_level("http://low.test/", -6);

        for _ in 0..20 {
            assert_eq!(filter.check("http://low.test/").await, TrustDecision::LowTrust);
        }
        assert_eq!(verifier.calls(), 0);
        assert_eq!(filter.trust_level("http://low.test/"), Some(MIN_TRUST));
    }

    #[tokio::test]
    async fn test_high_trust_passes_without_fetching() {
        let verifier = FixedVerifier::new(Verification::Banned("x".into()));
        let filter = never_skip(verifier.clone());
        filter.set_trust_level("http://good.test/", 5);

        let decision = filter.check("http://good.test/").await;

        assert_eq!(decision, TrustDecision::HighTrust);
        assert!(!decision.is_blocked());
        assert_eq!(filter.trust_level("http://good.test/"), Some(6));
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_sampled_skip_leaves_trust_unchanged() {
        let verifier = FixedVerifier::new(Verification::Clean);
        // 0.5 < 0.2 * 3, so trust 3 skips; 0.5 >= 0.2 * 2, so trust 2 verifies.
        let filter = TrustFilter::new(verifier.clone()).with_sampler(|| 0.5);

        filter.set_trust_level("http://three.test/", 3);
        assert_eq!(filter.check("http://three.test/").await, TrustDecision::Sampled);
        assert_eq!(filter.trust_level("http://three.test/"), Some(3));
        assert_eq!(verifier.calls(), 0);

        filter.set_trust_level("http://two.test/", 2);
        assert_eq!(filter.check("http://two.test/").await, TrustDecision::Verified);
        assert_eq!(filter.trust_level("http://two.test/"), Some(3));
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_trust_is_never_sampled() {
        let verifier = FixedVerifier::new(Verification::Clean);
        let filter = TrustFilter::new(verifier.clone()).with_sampler(|| 0.0);

        filter.check("http://new.test/").await;
        assert_eq!(verifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_scores_stay_in_bounds() {
        let clean = FixedVerifier::new(Verification::Clean);
        let filter = never_skip(clean);
        for _ in 0..40 {
            filter.check("http://up.test/").await;
            let level = filter.trust_level("http://up.test/").unwrap();
            assert!((MIN_TRUST..=MAX_TRUST).contains(&level));
        }
        assert_eq!(filter.trust_level("http://up.test/"), Some(MAX_TRUST));

        let banned = FixedVerifier::new(Verification::Banned("x".into()));
        let filter = never_skip(banned);
        for _ in 0..40 {
            filter.check("http://down.test/").await;
            let level = filter.trust_level("http://down.test/").unwrap();
            assert!((MIN_TRUST..=MAX_TRUST).contains(&level));
        }
        assert_eq!(filter.trust_level("http://down.test/"), Some(MIN_TRUST));

        filter.set_trust_level("http://x.test/", 100);
        assert_eq!(filter.trust_level("http://x.test/"), Some(MAX_TRUST));
    }

    #[tokio::test]
    async fn test_repeated_bans_reach_permanent_block() {
        let banned = FixedVerifier::new(Verification::Banned("x".into()));
        let filter = never_skip(banned.clone());

        // -1 .. -6 via verification, then low-trust blocks take over.
        for _ in 0..6 {
            assert!(filter.check("http://spam.test/").await.is_blocked());
        }
        assert_eq!(filter.trust_level("http://spam.test/"), Some(-6));
        assert_eq!(filter.check("http://spam.test/").await, TrustDecision::LowTrust);
        assert_eq!(banned.calls(), 6);
    }

    #[tokio::test]
    async fn test_concurrent_checks_do_not_lose_updates() {
        let verifier = FixedVerifier::new(Verification::Clean);
        let filter = Arc::new(never_skip(verifier));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let filter = Arc::clone(&filter);
                tokio::spawn(async move { filter.check("http://race.test/").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(filter.trust_level("http://race.test/"), Some(4));
    }

    #[tokio::test]
    async fn test_capacity_bounds_tracked_urls() {
        let verifier = FixedVerifier::new(Verification::Clean);
        let filter = TrustFilter::with_capacity(verifier, 3).with_sampler(|| 0.999);

        for i in 0..10 {
            filter.check(&format!("http://site{}.test/", i)).await;
        }
        assert_eq!(filter.tracked_urls(), 3);
        assert_eq!(filter.trust_level("http://site9.test/"), Some(1));
        assert_eq!(filter.trust_level("http://site0.test/"), None);
    }
}
