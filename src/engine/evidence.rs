//! Evidence-softmax probability engine.
//!
//! Pure function from (prior probabilities, scored posts, wall-clock now) to
//! a new probability vector plus diagnostics. Weaves time decay, spam
//! suppression, author dilution, engagement weighting, semantic evidence
//! aggregation, adaptive temperature, inertia mixing, and a probability floor
//! into one deterministic computation. No clock reads, no I/O.

use crate::models::{OutcomeScores, PostFeatures, PostMetrics};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const ALGORITHM: &str = "evidence-softmax-v1";

/// Hard post cutoff, also the store's compute window.
pub const MAX_AGE_MS: i64 = 259_200_000;

const MAX_AGE_S: f64 = 259_200.0;
/// Time-decay immunity window.
const GRACE_S: f64 = 300.0;
/// Exponential decay half-life after the grace window.
const HALF_LIFE_S: f64 = 21_600.0;
/// Window for counting an author's recent posts.
const AUTHOR_WINDOW_S: f64 = 86_400.0;

/// Superlinear semantic exponent.
const GAMMA: f64 = 1.15;
/// tanh squashing of stance.
const STANCE_K: f64 = 1.6;
/// Accept threshold on post weight after the grace window.
const W_MIN: f64 = 0.018;
/// Follower-count sigmoid center/scale (log1p domain).
const MU_F: f64 = 8.0;
const SIGMA_F: f64 = 1.5;
/// Engagement sigmoid center/scale (log1p domain).
const MU_E: f64 = 2.0;
const SIGMA_E: f64 = 1.5;
const VERIFIED_MULT: f64 = 1.2;
/// Base softmax temperature and its weakness expansion.
const T0: f64 = 1.0;
const ALPHA: f64 = 0.6;
/// Inertia time-constant over evidence mass.
const TAU: f64 = 0.65;
const EPS: f64 = 1e-12;
const PRIOR_MIN: f64 = 1e-6;

/// Outcome definition as the engine sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutcome {
    pub outcome_key: String,
    pub prior_probability: Option<f64>,
}

/// A fully scored post: per-outcome scores plus the author/engagement/feature
/// context the weighting model needs. Outcomes missing from `per_outcome`
/// contribute zero relevance and zero stance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePost {
    pub author_id: String,
    pub post_created_at_ms: i64,
    pub author_followers: Option<i64>,
    pub author_verified: bool,
    pub metrics: PostMetrics,
    pub features: PostFeatures,
    pub per_outcome: HashMap<String, OutcomeScores>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInput {
    pub market_id: String,
    pub now_ms: i64,
    pub outcomes: Vec<EngineOutcome>,
    pub prev_probabilities: Option<BTreeMap<String, f64>>,
    pub posts: Vec<EnginePost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDiagnostics {
    pub accepted_posts: u32,
    pub w_batch: f64,
    pub beta: f64,
    pub temperature: f64,
    pub floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutput {
    pub probabilities: BTreeMap<String, f64>,
    pub algorithm: String,
    pub diagnostics: EngineDiagnostics,
}

#[inline]
fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Scale in place so the vector sums to 1.
fn normalize(p: &mut [f64]) {
    let sum: f64 = p.iter().sum();
    if sum <= 0.0 {
        let u = 1.0 / p.len().max(1) as f64;
        p.iter_mut().for_each(|v| *v = u);
        return;
    }
    for v in p.iter_mut() {
        *v /= sum;
    }
}

/// Numerically stable softmax of pre-scaled logits.
fn softmax(logits: &[f64], temperature: f64) -> Vec<f64> {
    let scaled: Vec<f64> = logits.iter().map(|l| l / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Clamp to the floor while keeping the vector summing to 1: floored entries
/// pin to exactly `floor`, the remaining mass renormalizes over the rest.
/// Iterates because scaling can push further entries under the floor.
fn apply_floor(p: &mut [f64], floor: f64) {
    let k = p.len();
    if k == 0 || floor <= 0.0 {
        return;
    }
    if floor * k as f64 >= 1.0 {
        let u = 1.0 / k as f64;
        p.iter_mut().for_each(|v| *v = u);
        return;
    }

    let mut at_floor = vec![false; k];
    loop {
        let mut floored_mass = 0.0;
        let mut free_sum = 0.0;
        for (i, v) in p.iter().enumerate() {
            if at_floor[i] || *v < floor {
                at_floor[i] = true;
                floored_mass += floor;
            } else {
                free_sum += *v;
            }
        }
        if free_sum <= 0.0 {
            p.iter_mut().for_each(|v| *v = floor);
            normalize(p);
            return;
        }

        let target = 1.0 - floored_mass;
        let mut changed = false;
        for (i, v) in p.iter_mut().enumerate() {
            if at_floor[i] {
                *v = floor;
                continue;
            }
            let scaled = (*v * target) / free_sum;
            if scaled < floor {
                at_floor[i] = true;
                changed = true;
            } else {
                *v = scaled;
            }
        }
        if !changed {
            return;
        }
    }
}

/// Compute the new probability vector for a market.
///
/// Deterministic given identical inputs; permutation of `posts` changes the
/// result only within floating-point accumulation error.
pub fn compute(input: &EngineInput) -> EngineOutput {
    let k = input.outcomes.len();
    if k == 0 {
        return EngineOutput {
            probabilities: BTreeMap::new(),
            algorithm: ALGORITHM.to_string(),
            diagnostics: EngineDiagnostics {
                accepted_posts: 0,
                w_batch: 0.0,
                beta: 0.0,
                temperature: T0,
                floor: 0.0,
            },
        };
    }

    let floor = (0.01 / k as f64).max(0.001);
    let uniform = 1.0 / k as f64;

    // Normalized priors, then previous probabilities with missing keys
    // substituted by the outcome's prior.
    let mut priors: Vec<f64> = input
        .outcomes
        .iter()
        .map(|o| {
            o.prior_probability
                .filter(|p| p.is_finite())
                .unwrap_or(uniform)
                .clamp(PRIOR_MIN, 1.0)
        })
        .collect();
    normalize(&mut priors);

    let mut prev: Vec<f64> = match &input.prev_probabilities {
        Some(map) => input
            .outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| {
                map.get(&o.outcome_key)
                    .copied()
                    .filter(|p| p.is_finite())
                    .unwrap_or(priors[i])
                    .clamp(PRIOR_MIN, 1.0)
            })
            .collect(),
        None => priors.clone(),
    };
    normalize(&mut prev);

    // Author post counts within the 24h dilution window.
    let mut author_counts: HashMap<&str, u32> = HashMap::new();
    for post in &input.posts {
        let age_s = ((input.now_ms - post.post_created_at_ms) as f64 / 1000.0).max(0.0);
        if age_s <= AUTHOR_WINDOW_S {
            *author_counts.entry(post.author_id.as_str()).or_insert(0) += 1;
        }
    }

    let sqrt_k = (k as f64).sqrt();
    let mut delta_e = vec![0.0f64; k];
    let mut w_batch = 0.0f64;
    let mut accepted: u32 = 0;

    for post in &input.posts {
        let age_s = ((input.now_ms - post.post_created_at_ms) as f64 / 1000.0).max(0.0);
        if age_s > MAX_AGE_S {
            continue;
        }

        let d = if age_s <= GRACE_S {
            1.0
        } else {
            (-std::f64::consts::LN_2 * (age_s - GRACE_S) / HALF_LIFE_S).exp()
        };

        let likes = post.metrics.likes.unwrap_or(0).max(0) as f64;
        let reposts = post.metrics.reposts.unwrap_or(0).max(0) as f64;
        let replies = post.metrics.replies.unwrap_or(0).max(0) as f64;
        let quotes = post.metrics.quotes.unwrap_or(0).max(0) as f64;
        let engagement = (likes + 2.0 * reposts + 1.5 * replies + 2.5 * quotes).ln_1p();

        let followers = post.author_followers.unwrap_or(0).max(0) as f64;
        let f_sig = logistic((followers.ln_1p() - MU_F) / SIGMA_F);
        let e_sig = logistic((engagement - MU_E) / SIGMA_E);
        let mut m = (0.75 + 0.25 * f_sig) * (0.85 + 0.15 * e_sig);
        if post.author_verified {
            m *= VERIFIED_MULT;
        }

        let n_author = author_counts
            .get(post.author_id.as_str())
            .copied()
            .unwrap_or(1) as f64;
        let a = (1.0 / (1.0 + 0.75 * (n_author - 1.0).max(0.0)).sqrt()).max(0.35);

        let feats = &post.features;
        let s_cash = if feats.cashtag_count >= 6 {
            0.55
        } else if feats.cashtag_count >= 4 {
            0.75
        } else {
            1.0
        };
        let s_url = if feats.url_count >= 2 { 0.85 } else { 1.0 };
        let s_caps = if feats.caps_ratio > 0.6 { 0.9 } else { 1.0 };
        let s = s_cash * s_url * s_caps;

        // Post-level signals across all outcomes.
        let scores: Vec<OutcomeScores> = input
            .outcomes
            .iter()
            .map(|o| {
                post.per_outcome
                    .get(&o.outcome_key)
                    .map(|sc| sc.clamped())
                    .unwrap_or_default()
            })
            .collect();

        let mut z_p = 0.0f64;
        let mut max_relevance = 0.0f64;
        let mut max_credibility = 0.0f64;
        for sc in &scores {
            let sem = sc.relevance * sc.strength * sc.credibility;
            z_p = z_p.max(sem * sc.stance.abs());
            max_relevance = max_relevance.max(sc.relevance);
            max_credibility = max_credibility.max(sc.credibility);
        }

        let w_p = z_p.powf(GAMMA) * m * a * d * s;

        let accept = if age_s <= GRACE_S {
            max_relevance >= 0.1 && z_p >= 0.025
        } else {
            max_relevance >= 0.2 && max_credibility >= 0.15 && w_p >= W_MIN
        };
        if !accept {
            continue;
        }

        for (i, sc) in scores.iter().enumerate() {
            let base = sc.relevance * sc.strength * (sc.credibility * sc.confidence);
            delta_e[i] +=
                (STANCE_K * sc.stance).tanh() * base.powf(GAMMA) * m * a * d * s / sqrt_k;
        }
        w_batch += w_p;
        accepted += 1;
    }

    // Centered previous logits plus accumulated evidence.
    let l_prev: Vec<f64> = prev.iter().map(|p| (p + EPS).ln()).collect();
    let l_mean = l_prev.iter().sum::<f64>() / k as f64;
    let l_inst: Vec<f64> = l_prev
        .iter()
        .zip(&delta_e)
        .map(|(l, de)| (l - l_mean) + de)
        .collect();

    let temperature = T0 * (1.0 + ALPHA / (1.0 + w_batch).sqrt());
    let p_inst = softmax(&l_inst, temperature);

    let beta = 1.0 - (-w_batch / TAU).exp();
    let mut p_new: Vec<f64> = prev
        .iter()
        .zip(&p_inst)
        .map(|(pv, pi)| (1.0 - beta) * pv + beta * pi)
        .collect();

    apply_floor(&mut p_new, floor);

    let probabilities = input
        .outcomes
        .iter()
        .zip(&p_new)
        .map(|(o, p)| (o.outcome_key.clone(), *p))
        .collect();

    EngineOutput {
        probabilities,
        algorithm: ALGORITHM.to_string(),
        diagnostics: EngineDiagnostics {
            accepted_posts: accepted,
            w_batch,
            beta,
            temperature,
            floor,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const HOUR_MS: i64 = 3_600_000;

    fn two_outcomes() -> Vec<EngineOutcome> {
        vec![
            EngineOutcome {
                outcome_key: "a".into(),
                prior_probability: None,
            },
            EngineOutcome {
                outcome_key: "b".into(),
                prior_probability: None,
            },
        ]
    }

    fn scores(relevance: f64, stance: f64) -> OutcomeScores {
        OutcomeScores {
            relevance,
            stance,
            strength: 1.0,
            credibility: 1.0,
            confidence: 1.0,
        }
    }

    fn supportive_post(author: &str, created_at_ms: i64) -> EnginePost {
        let mut per_outcome = HashMap::new();
        per_outcome.insert("a".to_string(), scores(1.0, 1.0));
        per_outcome.insert("b".to_string(), scores(1.0, 0.0));
        EnginePost {
            author_id: author.to_string(),
            post_created_at_ms: created_at_ms,
            author_followers: Some(0),
            author_verified: false,
            metrics: PostMetrics::default(),
            features: PostFeatures::default(),
            per_outcome,
        }
    }

    fn input(now_ms: i64, posts: Vec<EnginePost>) -> EngineInput {
        EngineInput {
            market_id: "m1".into(),
            now_ms,
            outcomes: two_outcomes(),
            prev_probabilities: None,
            posts,
        }
    }

    #[test]
    fn uniform_when_empty() {
        let out = compute(&input(1_700_000_000_000, vec![]));
        assert_eq!(out.algorithm, ALGORITHM);
        assert_eq!(out.probabilities["a"], 0.5);
        assert_eq!(out.probabilities["b"], 0.5);
        assert_eq!(out.diagnostics.accepted_posts, 0);
        assert_eq!(out.diagnostics.beta, 0.0);
        assert!((out.diagnostics.temperature - 1.6).abs() < 1e-12);
    }

    #[test]
    fn zero_outcomes_yields_empty_vector() {
        let out = compute(&EngineInput {
            market_id: "m1".into(),
            now_ms: 0,
            outcomes: vec![],
            prev_probabilities: None,
            posts: vec![],
        });
        assert!(out.probabilities.is_empty());
        assert_eq!(out.diagnostics.accepted_posts, 0);
        assert_eq!(out.diagnostics.w_batch, 0.0);
        assert_eq!(out.diagnostics.temperature, 1.0);
    }

    #[test]
    fn single_outcome_is_certain() {
        let now = 1_700_000_000_000;
        let mut per_outcome = HashMap::new();
        per_outcome.insert("only".to_string(), scores(1.0, -1.0));
        let out = compute(&EngineInput {
            market_id: "m1".into(),
            now_ms: now,
            outcomes: vec![EngineOutcome {
                outcome_key: "only".into(),
                prior_probability: Some(0.2),
            }],
            prev_probabilities: None,
            posts: vec![EnginePost {
                author_id: "au".into(),
                post_created_at_ms: now - 60_000,
                author_followers: Some(100),
                author_verified: true,
                metrics: PostMetrics::default(),
                features: PostFeatures::default(),
                per_outcome,
            }],
        });
        assert!((out.probabilities["only"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fresh_supportive_post_moves_probability() {
        let now = 1_700_000_000_000;
        let out = compute(&input(now, vec![supportive_post("au1", now - 60_000)]));
        let a = out.probabilities["a"];
        let b = out.probabilities["b"];
        assert!(a > 0.5, "a = {a}");
        assert!(b < 0.5, "b = {b}");
        assert!((a + b - 1.0).abs() < 1e-9);
        assert_eq!(out.diagnostics.accepted_posts, 1);
        assert!(out.diagnostics.beta > 0.0);
    }

    #[test]
    fn post_older_than_max_age_is_dropped() {
        let now = 1_700_000_000_000;
        let out = compute(&input(now, vec![supportive_post("au1", now - 73 * HOUR_MS)]));
        assert_eq!(out.diagnostics.accepted_posts, 0);
        assert_eq!(out.diagnostics.w_batch, 0.0);
        assert_eq!(out.probabilities["a"], 0.5);
        assert_eq!(out.probabilities["b"], 0.5);
    }

    #[test]
    fn spam_features_attenuate_weight() {
        let now = 1_700_000_000_000;
        let clean = compute(&input(now, vec![supportive_post("au1", now - 10_000)]));

        let mut spammy = supportive_post("au1", now - 10_000);
        spammy.features = PostFeatures {
            cashtag_count: 7,
            mention_count: 0,
            url_count: 2,
            caps_ratio: 0.9,
            is_reply: None,
            is_quote: None,
        };
        let spam = compute(&input(now, vec![spammy]));

        assert_eq!(spam.diagnostics.accepted_posts, 1);
        let ratio = spam.diagnostics.w_batch / clean.diagnostics.w_batch;
        // 0.55 (cashtags) * 0.85 (urls) * 0.9 (caps)
        assert!((ratio - 0.42075).abs() < 1e-9, "ratio = {ratio}");
    }

    #[test]
    fn author_dilution_attenuates_weight() {
        let now = 1_700_000_000_000;
        let single = compute(&input(now, vec![supportive_post("solo", now - 60_000)]));

        let four: Vec<EnginePost> = (0..4)
            .map(|i| supportive_post("prolific", now - 60_000 - i * 1000))
            .collect();
        let diluted = compute(&input(now, four));

        assert_eq!(diluted.diagnostics.accepted_posts, 4);
        // Each of the 4 posts carries A = 1/sqrt(1 + 0.75*3); decay over the
        // few seconds between them is within the grace window, so the batch
        // weight is exactly 4*A times the single-post weight.
        let expected_a = 1.0 / (1.0f64 + 0.75 * 3.0).sqrt();
        let ratio = diluted.diagnostics.w_batch / (4.0 * single.diagnostics.w_batch);
        assert!((ratio - expected_a).abs() < 1e-9, "ratio = {ratio}");
    }

    #[test]
    fn floor_activates_and_sum_stays_one() {
        let now = 1_700_000_000_000;
        let outcomes: Vec<EngineOutcome> = (0..100)
            .map(|i| EngineOutcome {
                outcome_key: format!("o{i}"),
                prior_probability: None,
            })
            .collect();

        let posts: Vec<EnginePost> = (0..80)
            .map(|i| {
                let mut per_outcome = HashMap::new();
                per_outcome.insert("o0".to_string(), scores(1.0, 1.0));
                EnginePost {
                    author_id: format!("author{i}"),
                    post_created_at_ms: now - 60_000,
                    author_followers: Some(5_000_000),
                    author_verified: true,
                    metrics: PostMetrics {
                        likes: Some(500),
                        reposts: Some(200),
                        replies: Some(50),
                        quotes: Some(30),
                    },
                    features: PostFeatures::default(),
                    per_outcome,
                }
            })
            .collect();

        let out = compute(&EngineInput {
            market_id: "m1".into(),
            now_ms: now,
            outcomes,
            prev_probabilities: None,
            posts,
        });

        let floor = out.diagnostics.floor;
        assert_eq!(floor, 0.001);
        let sum: f64 = out.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum = {sum}");
        assert!(out.probabilities["o0"] > 0.5);
        for (key, p) in &out.probabilities {
            assert!(*p >= floor - 1e-12, "{key} below floor: {p}");
            if key != "o0" {
                assert!((*p - floor).abs() < 1e-12, "{key} not pinned: {p}");
            }
        }
    }

    #[test]
    fn previous_probabilities_missing_key_uses_prior() {
        let now = 1_700_000_000_000;
        let mut prev = BTreeMap::new();
        prev.insert("a".to_string(), 0.9);
        // "b" missing: substituted by its prior (uniform 0.5), then the
        // vector renormalizes.
        let out = compute(&EngineInput {
            market_id: "m1".into(),
            now_ms: now,
            outcomes: two_outcomes(),
            prev_probabilities: Some(prev),
            posts: vec![],
        });
        let a = out.probabilities["a"];
        let b = out.probabilities["b"];
        assert!((a - 0.9 / 1.4).abs() < 1e-12);
        assert!((b - 0.5 / 1.4).abs() < 1e-12);
    }

    #[test]
    fn deterministic_bitwise() {
        let now = 1_700_000_000_000;
        let posts = vec![
            supportive_post("au1", now - 60_000),
            supportive_post("au2", now - 7 * HOUR_MS),
            supportive_post("au1", now - 20 * HOUR_MS),
        ];
        let one = compute(&input(now, posts.clone()));
        let two = compute(&input(now, posts));
        for (key, p) in &one.probabilities {
            assert_eq!(p.to_bits(), two.probabilities[key].to_bits());
        }
        assert_eq!(
            one.diagnostics.w_batch.to_bits(),
            two.diagnostics.w_batch.to_bits()
        );
    }

    #[test]
    fn post_order_does_not_matter() {
        let now = 1_700_000_000_000;
        let mut posts: Vec<EnginePost> = Vec::new();
        for i in 0..20i64 {
            let mut p = supportive_post(&format!("au{}", i % 7), now - i * HOUR_MS / 2);
            p.author_followers = Some(10i64.pow((i % 6) as u32));
            p.metrics.likes = Some(i * 3);
            if i % 3 == 0 {
                p.per_outcome.insert("b".to_string(), scores(0.8, -0.6));
            }
            posts.push(p);
        }
        let baseline = compute(&input(now, posts.clone()));

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut max_dev = 0.0f64;
        for _ in 0..1000 {
            posts.shuffle(&mut rng);
            let out = compute(&input(now, posts.clone()));
            for (key, p) in &baseline.probabilities {
                max_dev = max_dev.max((p - out.probabilities[key]).abs());
            }
        }
        assert!(max_dev < 1e-9, "max deviation = {max_dev}");
    }

    #[test]
    fn grace_window_uses_loose_thresholds() {
        let now = 1_700_000_000_000;
        // Weak post: low relevance, tiny evidence. Inside grace it passes the
        // loose gate; outside it fails the W_MIN gate.
        let mut weak = supportive_post("au1", now - 60_000);
        weak.per_outcome
            .insert("a".to_string(), scores(0.15, 0.9));
        weak.per_outcome.insert("b".to_string(), scores(0.1, 0.0));
        let in_grace = compute(&input(now, vec![weak.clone()]));
        assert_eq!(in_grace.diagnostics.accepted_posts, 1);

        weak.post_created_at_ms = now - 2 * HOUR_MS;
        let aged = compute(&input(now, vec![weak]));
        assert_eq!(aged.diagnostics.accepted_posts, 0);
    }

    #[test]
    fn out_of_range_scores_are_clamped_not_rejected() {
        let now = 1_700_000_000_000;
        let mut per_outcome = HashMap::new();
        per_outcome.insert(
            "a".to_string(),
            OutcomeScores {
                relevance: 3.0,
                stance: 9.0,
                strength: 1.5,
                credibility: 2.0,
                confidence: 1.0,
            },
        );
        let mut post = supportive_post("au1", now - 60_000);
        post.per_outcome = per_outcome;
        let out = compute(&input(now, vec![post]));
        assert_eq!(out.diagnostics.accepted_posts, 1);
        let sum: f64 = out.probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(out.probabilities.values().all(|p| p.is_finite()));
    }

    #[test]
    fn opposing_evidence_cancels() {
        let now = 1_700_000_000_000;
        let mut up = supportive_post("au1", now - 60_000);
        up.per_outcome.insert("a".to_string(), scores(1.0, 1.0));
        let mut down = supportive_post("au2", now - 60_000);
        down.per_outcome.insert("a".to_string(), scores(1.0, -1.0));

        let out = compute(&input(now, vec![up, down]));
        assert_eq!(out.diagnostics.accepted_posts, 2);
        // Evidence cancels in logit space; the mix can only keep a at 0.5.
        assert!((out.probabilities["a"] - 0.5).abs() < 1e-9);
    }
}
