//! 文本置信度启发式
//!
//! 基线 0.7；每个出现的犹豫词 -0.15（累计最多 -0.6），每个出现的肯定短语 +0.1（累计最多 +0.3），结果截断到 [0, 1]。
//! 匹配是大小写不敏感的子串包含，没有词边界：例如 "unlikely" 会命中 "likely"。
//! 每个词条只计一次，不按出现次数累计。

/// 犹豫 / 不确定措辞
pub const HEDGING_WORDS: &[&str] = &[
    "maybe",
    "possibly",
    "perhaps",
    "might",
    "could",
    "probably",
    "likely",
    "uncertain",
    "not sure",
    "i think",
    "i believe",
    "seems like",
    "appears to",
];

/// 高置信度措辞
pub const CONFIDENCE_PHRASES: &[&str] = &[
    "definitely",
    "certainly",
    "absolutely",
    "clearly",
    "obviously",
    "without doubt",
    "for sure",
    "guaranteed",
];

const BASELINE: f64 = 0.7;
const HEDGE_PENALTY: f64 = 0.15;
const MAX_HEDGE_PENALTY: f64 = 0.6;
const CONFIDENCE_BONUS: f64 = 0.1;
const MAX_CONFIDENCE_BONUS: f64 = 0.3;

/// 文本中命中的词条
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfidenceMarkers {
    pub hedging: Vec<&'static str>,
    pub confident: Vec<&'static str>,
}

/// 无状态估计器
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfidenceEstimator;

impl ConfidenceEstimator {
    /// 返回 [0, 1] 的置信度；同一输入总是得到同一结果
    pub fn estimate(text: &str) -> f64 {
        Self::score(&Self::markers(text))
    }

    /// 找出命中的犹豫词与肯定短语
    pub fn markers(text: &str) -> ConfidenceMarkers {
        let lower = text.to_lowercase();
        ConfidenceMarkers {
            hedging: HEDGING_WORDS
                .iter()
                .copied()
                .filter(|w| lower.contains(w))
                .collect(),
            confident: CONFIDENCE_PHRASES
                .iter()
                .copied()
                .filter(|p| lower.contains(p))
                .collect(),
        }
    }

    pub fn score(markers: &ConfidenceMarkers) -> f64 {
        let penalty = (markers.hedging.len() as f64 * HEDGE_PENALTY).min(MAX_HEDGE_PENALTY);
        let bonus = (markers.confident.len() as f64 * CONFIDENCE_BONUS).min(MAX_CONFIDENCE_BONUS);
        (BASELINE - penalty + bonus).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_neutral_text() {
        assert!(approx(ConfidenceEstimator::estimate("The capital of France is Paris."), 0.7));
        assert!(approx(ConfidenceEstimator::estimate(""), 0.7));
    }

    #[test]
    fn test_hedging_lowers_confidence() {
        let c = ConfidenceEstimator::estimate("Maybe it is X, possibly Y.");
        assert!(approx(c, 0.4));
    }

    #[test]
    fn test_hedging_penalty_is_capped() {
        let text = "maybe possibly perhaps might could probably not sure i think";
        assert!(approx(ConfidenceEstimator::estimate(text), 0.1));
    }

    #[test]
    fn test_confidence_bonus_is_capped() {
        let text = "definitely certainly absolutely clearly obviously guaranteed";
        assert!(approx(ConfidenceEstimator::estimate(text), 1.0));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(
            ConfidenceEstimator::estimate("MAYBE"),
            ConfidenceEstimator::estimate("maybe")
        );
    }

    #[test]
    fn test_repeated_word_counts_once() {
        assert_eq!(
            ConfidenceEstimator::estimate("maybe maybe maybe"),
            ConfidenceEstimator::estimate("maybe")
        );
    }

    #[test]
    fn test_always_in_unit_interval() {
        let texts = [
            "",
            "maybe",
            "definitely definitely",
            "maybe possibly perhaps might could probably likely uncertain not sure i think i believe seems like appears to",
            "definitely certainly absolutely clearly obviously without doubt for sure guaranteed",
        ];
        for t in texts {
            let c = ConfidenceEstimator::estimate(t);
            assert!((0.0..=1.0).contains(&c), "{t} -> {c}");
        }
    }

    #[test]
    fn test_pure() {
        let text = "I think this could be right, clearly.";
        let first = ConfidenceEstimator::estimate(text);
        let _ = ConfidenceEstimator::estimate("something else entirely");
        assert_eq!(first, ConfidenceEstimator::estimate(text));
    }

    /// 已知局限：子串匹配没有词边界
    #[test]
    fn test_substring_matching_without_word_boundaries() {
        let markers = ConfidenceEstimator::markers("That is unlikely.");
        assert_eq!(markers.hedging, vec!["likely"]);
        // "couldn't" 同样命中 "could"
        assert!(ConfidenceEstimator::estimate("It couldn't fail") < 0.7);
    }
}
