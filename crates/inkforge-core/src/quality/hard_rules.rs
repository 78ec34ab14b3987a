//! Deterministic hard-rule checks
//!
//! The first quality layer: word counts, keyword presence, structural flags,
//! and forbidden words. Any failing rule zeroes the score; a clean pass
//! scores 100.

use serde::{Deserialize, Serialize};

/// Keyword matching mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMode {
    /// Every keyword must appear
    #[default]
    All,
    /// At least one keyword must appear
    Any,
}

/// Declared hard constraints for an artifact
///
/// Field names are camelCase to match the `hardConstraints` parameter object
/// submitted by callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HardRules {
    pub min_words: Option<usize>,
    pub max_words: Option<usize>,
    pub required_keywords: Vec<String>,
    pub keyword_mode: KeywordMode,
    pub require_title: bool,
    pub require_intro: bool,
    pub require_conclusion: bool,
    pub min_sections: Option<usize>,
    pub min_paragraphs: Option<usize>,
    pub require_bullet_list: bool,
    pub require_numbered_list: bool,
    pub forbidden_words: Vec<String>,
}

impl HardRules {
    /// Whether any rule is actually configured
    pub fn is_empty(&self) -> bool {
        *self == HardRules::default()
    }
}

/// Severity of a reported issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// One reported issue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityIssue {
    pub severity: IssueSeverity,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Verdict of the hard-rule layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardRuleReport {
    pub passed: bool,
    /// 0 when any rule failed, 100 otherwise
    pub score: u8,
    pub word_count: usize,
    pub issues: Vec<QualityIssue>,
}

/// Count words treating each CJK character as one word
///
/// Whitespace-separated runs of non-CJK characters count as one word each;
/// every CJK character counts on its own and terminates any run in progress.
pub fn word_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for c in text.chars() {
        if is_cjk(c) {
            count += 1;
            in_word = false;
        } else if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            count += 1;
            in_word = true;
        }
    }
    count
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK unified ideographs
        | '\u{3400}'..='\u{4DBF}' // extension A
        | '\u{F900}'..='\u{FAFF}' // compatibility ideographs
        | '\u{3040}'..='\u{30FF}' // hiragana + katakana
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
    )
}

/// Evaluate the hard rules against an artifact
pub fn evaluate(rules: &HardRules, text: &str) -> HardRuleReport {
    let mut issues = vec![];
    let words = word_count(text);
    let lines: Vec<&str> = text.lines().collect();
    let paragraphs = split_paragraphs(text);

    if let Some(min) = rules.min_words {
        if words < min {
            issues.push(issue(
                "word_count",
                format!("word count {words} is below the minimum of {min}"),
                Some(format!("expand the content to at least {min} words")),
            ));
        }
    }
    if let Some(max) = rules.max_words {
        if words > max {
            issues.push(issue(
                "word_count",
                format!("word count {words} exceeds the maximum of {max}"),
                Some(format!("shorten the content to at most {max} words")),
            ));
        }
    }

    if !rules.required_keywords.is_empty() {
        let lower = text.to_lowercase();
        let present: Vec<&String> = rules
            .required_keywords
            .iter()
            .filter(|k| lower.contains(&k.to_lowercase()))
            .collect();
        let ok = match rules.keyword_mode {
            KeywordMode::All => present.len() == rules.required_keywords.len(),
            KeywordMode::Any => !present.is_empty(),
        };
        if !ok {
            let missing: Vec<String> = rules
                .required_keywords
                .iter()
                .filter(|k| !present.contains(k))
                .cloned()
                .collect();
            issues.push(issue(
                "keywords",
                format!("required keywords missing: {}", missing.join(", ")),
                Some("work the missing keywords into the content".to_string()),
            ));
        }
    }

    for word in &rules.forbidden_words {
        if text.to_lowercase().contains(&word.to_lowercase()) {
            issues.push(issue(
                "forbidden_words",
                format!("forbidden word present: {word}"),
                Some(format!("remove every occurrence of '{word}'")),
            ));
        }
    }

    if rules.require_title {
        let title_ok = lines
            .iter()
            .find(|l| !l.trim().is_empty())
            .map(|l| {
                let t = l.trim().trim_start_matches('#').trim();
                !t.is_empty() && t.chars().count() <= 120
            })
            .unwrap_or(false);
        if !title_ok {
            issues.push(issue(
                "structure",
                "no title found on the first non-empty line".to_string(),
                Some("open with a short title line".to_string()),
            ));
        }
    }

    if rules.require_intro {
        // The paragraph after the title should be a short opener
        let intro_ok = paragraphs
            .get(1)
            .or_else(|| paragraphs.first())
            .map(|p| {
                let w = word_count(p);
                w > 0 && w <= 150
            })
            .unwrap_or(false);
        if !intro_ok {
            issues.push(issue(
                "structure",
                "no short introductory paragraph found".to_string(),
                Some("add a brief opening paragraph".to_string()),
            ));
        }
    }

    if rules.require_conclusion {
        let conclusion_ok = paragraphs
            .last()
            .map(|p| word_count(p) >= 15)
            .unwrap_or(false);
        if !conclusion_ok {
            issues.push(issue(
                "structure",
                "closing paragraph is missing or trivial".to_string(),
                Some("finish with a substantive conclusion".to_string()),
            ));
        }
    }

    if let Some(min) = rules.min_sections {
        let sections = lines
            .iter()
            .filter(|l| l.trim_start().starts_with('#'))
            .count();
        if sections < min {
            issues.push(issue(
                "structure",
                format!("{sections} sections found, {min} required"),
                Some(format!("structure the content into at least {min} sections")),
            ));
        }
    }

    if let Some(min) = rules.min_paragraphs {
        if paragraphs.len() < min {
            issues.push(issue(
                "structure",
                format!("{} paragraphs found, {min} required", paragraphs.len()),
                Some(format!("break the content into at least {min} paragraphs")),
            ));
        }
    }

    if rules.require_bullet_list {
        let has_bullets = lines.iter().any(|l| {
            let t = l.trim_start();
            t.starts_with("- ") || t.starts_with("* ")
        });
        if !has_bullets {
            issues.push(issue(
                "structure",
                "no bullet list found".to_string(),
                Some("summarize key points in a bullet list".to_string()),
            ));
        }
    }

    if rules.require_numbered_list {
        let has_numbered = lines.iter().any(|l| {
            let t = l.trim_start();
            let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
            digits > 0 && matches!(t.as_bytes().get(digits), Some(b'.') | Some(b')'))
        });
        if !has_numbered {
            issues.push(issue(
                "structure",
                "no numbered list found".to_string(),
                Some("enumerate steps in a numbered list".to_string()),
            ));
        }
    }

    let passed = issues.is_empty();
    HardRuleReport {
        passed,
        score: if passed { 100 } else { 0 },
        word_count: words,
        issues,
    }
}

fn issue(category: &str, message: String, suggestion: Option<String>) -> QualityIssue {
    QualityIssue {
        severity: IssueSeverity::Error,
        category: category.to_string(),
        message,
        suggestion,
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = vec![];
    let mut current = String::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.trim().is_empty() {
                paragraphs.push(current.trim().to_string());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count_latin() {
        assert_eq!(word_count("hello world"), 2);
        assert_eq!(word_count("  spaced   out  "), 2);
        assert_eq!(word_count(""), 0);
    }

    #[test]
    fn test_word_count_cjk() {
        // Each CJK character is one word
        assert_eq!(word_count("你好世界"), 4);
        // Mixed: 2 CJK + 1 latin run
        assert_eq!(word_count("你好 rust"), 3);
        // CJK breaks a latin run in two
        assert_eq!(word_count("ab漢cd"), 3);
    }

    #[test]
    fn test_max_words_violation() {
        let rules = HardRules {
            max_words: Some(3),
            ..Default::default()
        };
        let report = evaluate(&rules, "one two three four");
        assert!(!report.passed);
        assert_eq!(report.score, 0);
        assert_eq!(report.issues[0].category, "word_count");
    }

    #[test]
    fn test_keywords_all_mode() {
        let rules = HardRules {
            required_keywords: vec!["rust".into(), "tokio".into()],
            ..Default::default()
        };
        assert!(!evaluate(&rules, "all about Rust").passed);
        assert!(evaluate(&rules, "Rust with Tokio").passed);
    }

    #[test]
    fn test_keywords_any_mode() {
        let rules = HardRules {
            required_keywords: vec!["rust".into(), "tokio".into()],
            keyword_mode: KeywordMode::Any,
            ..Default::default()
        };
        assert!(evaluate(&rules, "all about Rust").passed);
        assert!(!evaluate(&rules, "nothing relevant").passed);
    }

    #[test]
    fn test_forbidden_words_case_insensitive() {
        let rules = HardRules {
            forbidden_words: vec!["banned".into()],
            ..Default::default()
        };
        let report = evaluate(&rules, "This is BANNED content");
        assert!(!report.passed);
        assert_eq!(report.issues[0].category, "forbidden_words");
    }

    #[test]
    fn test_structural_checks() {
        let rules = HardRules {
            require_title: true,
            require_conclusion: true,
            min_paragraphs: Some(3),
            require_bullet_list: true,
            ..Default::default()
        };
        let text = "# A Good Title\n\nA short intro paragraph here.\n\n- point one\n- point two\n\nA proper closing paragraph that wraps up the discussion with enough substance to count as a conclusion for the reader.";
        let report = evaluate(&rules, text);
        assert!(report.passed, "issues: {:?}", report.issues);
    }

    #[test]
    fn test_clean_pass_scores_100() {
        let report = evaluate(&HardRules::default(), "anything goes");
        assert!(report.passed);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn test_camel_case_deserialization() {
        let rules: HardRules =
            serde_json::from_value(serde_json::json!({"maxWords": 200, "minWords": 10}))
                .unwrap();
        assert_eq!(rules.max_words, Some(200));
        assert_eq!(rules.min_words, Some(10));
    }
}
