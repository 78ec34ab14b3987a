//! Combined quality report
//!
//! Merges the hard-rule and LLM layers into the single verdict consumed by
//! conditional routing.

use serde::{Deserialize, Serialize};

use super::hard_rules::HardRuleReport;
use super::llm_eval::LlmEvaluation;

/// Both layers, aggregated
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityDetails {
    pub hard: HardRuleReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmEvaluation>,
}

/// The combined verdict of a quality check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    /// Overall score on the [0, 10] scale: the LLM score when the LLM ran,
    /// otherwise the hard-rule score scaled down (100 -> 10)
    pub score: f64,

    /// hard passed AND (llm passed, if it ran)
    pub passed: bool,

    pub hard_constraints_passed: bool,

    pub details: QualityDetails,

    /// Hard-rule suggestions merged with LLM suggestions, deduplicated
    pub fix_suggestions: Vec<String>,

    /// Whether this verdict came from the cache
    #[serde(default)]
    pub from_cache: bool,
}

impl QualityReport {
    /// Combine the two layers
    pub fn combine(hard: HardRuleReport, llm: Option<LlmEvaluation>) -> Self {
        let score = match &llm {
            Some(eval) => eval.score,
            None => f64::from(hard.score) / 10.0,
        };
        let passed = hard.passed && llm.as_ref().map(|e| e.passed).unwrap_or(true);

        let mut fix_suggestions: Vec<String> = vec![];
        for issue in &hard.issues {
            if let Some(s) = &issue.suggestion {
                if !fix_suggestions.contains(s) {
                    fix_suggestions.push(s.clone());
                }
            }
        }
        if let Some(eval) = &llm {
            for s in &eval.suggestions {
                if !fix_suggestions.contains(s) {
                    fix_suggestions.push(s.clone());
                }
            }
        }

        Self {
            score,
            passed,
            hard_constraints_passed: hard.passed,
            details: QualityDetails { hard, llm },
            fix_suggestions,
            from_cache: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::hard_rules::{evaluate, HardRules};
    use std::collections::BTreeMap;

    fn passing_hard() -> HardRuleReport {
        evaluate(&HardRules::default(), "some fine text")
    }

    fn failing_hard() -> HardRuleReport {
        let rules = HardRules {
            max_words: Some(1),
            ..Default::default()
        };
        evaluate(&rules, "far too many words here")
    }

    fn llm(score: f64, passed: bool, suggestions: Vec<&str>) -> LlmEvaluation {
        LlmEvaluation {
            score,
            passed,
            dimensions: BTreeMap::new(),
            strengths: vec![],
            weaknesses: vec![],
            suggestions: suggestions.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_hard_only_scales_score() {
        let report = QualityReport::combine(passing_hard(), None);
        assert!(report.passed);
        assert_eq!(report.score, 10.0);

        let report = QualityReport::combine(failing_hard(), None);
        assert!(!report.passed);
        assert_eq!(report.score, 0.0);
        assert!(!report.hard_constraints_passed);
    }

    #[test]
    fn test_llm_score_wins_when_it_ran() {
        let report = QualityReport::combine(passing_hard(), Some(llm(8.2, true, vec![])));
        assert!(report.passed);
        assert_eq!(report.score, 8.2);
    }

    #[test]
    fn test_both_layers_must_pass() {
        let report = QualityReport::combine(passing_hard(), Some(llm(5.0, false, vec![])));
        assert!(!report.passed);
        assert!(report.hard_constraints_passed);
    }

    #[test]
    fn test_suggestions_merged_and_deduplicated() {
        let hard = failing_hard();
        let hard_suggestion = hard.issues[0].suggestion.clone().unwrap();
        let report = QualityReport::combine(
            hard,
            Some(llm(3.0, false, vec![hard_suggestion.as_str(), "vary sentence length"])),
        );
        assert_eq!(
            report.fix_suggestions.iter().filter(|s| **s == hard_suggestion).count(),
            1
        );
        assert!(report
            .fix_suggestions
            .contains(&"vary sentence length".to_string()));
    }
}
