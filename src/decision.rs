//! 判定引擎 (Decision Engine)
//!
//! 规则：
//! 1. 精确命中 -> score = 1.0, verdict = true
//! 2. 否则取最近的近似候选：score = 1 - distance / 64，
//!    verdict = score > threshold && distance <= max_distance
//! 3. 没有候选 -> score = 0, verdict = false
//!
//! 结果必须可解释：带上命中的作品、距离以及当时生效的策略参数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DecisionPolicy;
use crate::corpus::{Candidate, Work, WorkId};
use crate::fingerprint::SIGNATURE_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Approximate,
    None,
}

/// 命中的作品摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedWork {
    pub work_id: WorkId,
    pub owner: String,
    pub registered_at: DateTime<Utc>,
}

impl From<&Work> for MatchedWork {
    fn from(work: &Work) -> Self {
        Self {
            work_id: work.id.clone(),
            owner: work.owner.clone(),
            registered_at: work.registered_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// [0, 1]
    pub score: f64,
    pub verdict: bool,
    pub match_kind: MatchKind,
    /// 最接近的作品 (即使 verdict 为 false 也会给出，便于复核)
    pub work: Option<MatchedWork>,
    /// 近似命中的汉明距离；精确命中为 0
    pub distance: Option<u32>,
    pub threshold: f64,
    pub max_distance: u32,
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// `candidates` 必须已按距离升序排列 (见 `CorpusIndex::lookup_approximate`)
    pub fn decide(&self, exact: Option<&Work>, candidates: &[Candidate]) -> Decision {
        if let Some(work) = exact {
            return Decision {
                score: 1.0,
                verdict: true,
                match_kind: MatchKind::Exact,
                work: Some(MatchedWork::from(work)),
                distance: Some(0),
                threshold: self.policy.threshold,
                max_distance: self.policy.max_distance,
            };
        }

        let closest = candidates
            .iter()
            .filter(|c| c.distance <= self.policy.max_distance)
            .min_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.work.seq.cmp(&b.work.seq)));

        match closest {
            Some(candidate) => {
                let score = score_for_distance(candidate.distance);
                Decision {
                    score,
                    verdict: score > self.policy.threshold
                        && candidate.distance <= self.policy.max_distance,
                    match_kind: MatchKind::Approximate,
                    work: Some(MatchedWork::from(candidate.work.as_ref())),
                    distance: Some(candidate.distance),
                    threshold: self.policy.threshold,
                    max_distance: self.policy.max_distance,
                }
            }
            None => Decision {
                score: 0.0,
                verdict: false,
                match_kind: MatchKind::None,
                work: None,
                distance: None,
                threshold: self.policy.threshold,
                max_distance: self.policy.max_distance,
            },
        }
    }
}

/// 距离 -> 相似度，单调不增
pub fn score_for_distance(distance: u32) -> f64 {
    let normalized = f64::from(distance.min(SIGNATURE_BITS)) / f64::from(SIGNATURE_BITS);
    (1.0 - normalized).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{ExactDigest, FingerprintSet};
    use std::sync::Arc;

    fn work(id: &str, seq: u64) -> Arc<Work> {
        Arc::new(Work {
            id: WorkId::from(id),
            owner: "owner".to_string(),
            fingerprints: vec![FingerprintSet {
                exact: ExactDigest::of(id.as_bytes()),
                approximate: vec![],
            }],
            registered_at: Utc::now(),
            seq,
            revoked_at: None,
        })
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(DecisionPolicy::default())
    }

    #[test]
    fn exact_match_is_unconditional() {
        let a = work("A", 0);
        let decision = engine().decide(Some(&a), &[]);
        assert_eq!(decision.score, 1.0);
        assert!(decision.verdict);
        assert_eq!(decision.match_kind, MatchKind::Exact);
        assert_eq!(decision.work.unwrap().work_id, WorkId::from("A"));
    }

    #[test]
    fn no_candidates_means_zero_and_not_infringing() {
        let decision = engine().decide(None, &[]);
        assert_eq!(decision.score, 0.0);
        assert!(!decision.verdict);
        assert_eq!(decision.match_kind, MatchKind::None);
        assert!(decision.work.is_none());
    }

    #[test]
    fn approximate_verdict_follows_threshold() {
        // 0.85 阈值：距离 9 -> 0.859 (侵权)，距离 10 已超出默认 max_distance 8
        let policy = DecisionPolicy { threshold: 0.85, max_distance: 12 };
        let engine = DecisionEngine::new(policy);
        let a = work("A", 0);

        let close = engine.decide(None, &[Candidate { work: Arc::clone(&a), distance: 9 }]);
        assert!(close.verdict);
        assert_eq!(close.distance, Some(9));

        let weak = engine.decide(None, &[Candidate { work: Arc::clone(&a), distance: 10 }]);
        assert!(!weak.verdict);
        assert!(weak.score > 0.0);
        assert_eq!(weak.work.unwrap().work_id, WorkId::from("A"));
    }

    #[test]
    fn candidates_beyond_max_distance_never_match() {
        // 阈值放得很低，也不能让超出 max_distance 的候选通过
        let engine = DecisionEngine::new(DecisionPolicy { threshold: 0.1, max_distance: 4 });
        let decision = engine.decide(None, &[Candidate { work: work("A", 0), distance: 5 }]);
        assert!(!decision.verdict);
        assert_eq!(decision.score, 0.0);
    }

    #[test]
    fn score_is_monotone_in_distance() {
        let scores: Vec<f64> = (0..=64).map(score_for_distance).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(scores[0], 1.0);
        assert_eq!(scores[64], 0.0);
        assert!(score_for_distance(100) >= 0.0);

        let engine = engine();
        let near = engine.decide(None, &[Candidate { work: work("A", 0), distance: 2 }]);
        let far = engine.decide(None, &[Candidate { work: work("B", 1), distance: 6 }]);
        assert!(near.score >= far.score);
    }

    #[test]
    fn ties_prefer_earliest_registration() {
        let decision = engine().decide(
            None,
            &[
                Candidate { work: work("later", 5), distance: 3 },
                Candidate { work: work("earlier", 1), distance: 3 },
            ],
        );
        assert_eq!(decision.work.unwrap().work_id, WorkId::from("earlier"));
    }
}
