// =============================================================================
// classifier.rs — THE SIMD-ACCELERATED DOCKET TEXT ANNIHILATOR
// =============================================================================
//
// This module is where we do the actual "what just happened on this docket?"
// determination. And we do it FAST. How fast? We use:
//
// 1. Aho-Corasick automatons — multi-pattern matching that scans a docket
//    description for ALL keywords in a set simultaneously in a single pass.
//    O(n + m) where n is the text length and m is the total number of
//    matches. Built on a finite automaton. This is how antivirus scanners
//    work. We're using antivirus-grade technology to spot the phrase
//    "motion to dismiss". Let that sink in.
//
// 2. memchr — SIMD-accelerated substring scanning as a "bouncer at the
//    door" check before firing up eight automatons for a description that
//    says "Certificate of Service".
//
// 3. Rayon parallel iterators — when a delta has forty new entries to
//    classify, we classify them on every core we own. Leaving cores idle
//    while there are judgments to detect is practically malpractice.
//
// One deliberate difference from a hardcoded keyword scanner: every list
// here arrives through Config. Legal terminology is heuristic territory —
// the lists are data to be tuned per deployment, not logic to be compiled.
// =============================================================================

use aho_corasick::AhoCorasick;
use rayon::prelude::*;
use tracing::debug;

use crate::config::Config;
use crate::error::MonitorError;
use crate::models::{ChangeType, Severity};

/// One keyword set compiled into an automaton, tagged with the change type
/// it produces. Order matters: classification output follows the order of
/// this list, deterministically.
struct TypeSet {
    change_type: ChangeType,
    automaton: AhoCorasick,
}

/// The classification engine. Built once from config at startup, then
/// shared immutably by every check worker — automatons are happily
/// `Send + Sync` because they never change after construction.
pub struct Classifier {
    /// The five disjoint type sets: motion, order, judgment, hearing,
    /// deadline — in that order, always.
    type_sets: Vec<TypeSet>,
    /// Forces severity to Urgent. The only road to Urgent that doesn't
    /// start at a judgment.
    urgent: AhoCorasick,
    /// Bumps severity exactly one level, capped at Critical.
    decisive: AhoCorasick,
    /// Scanned against case titles/tags for the scheduler's priority boost.
    urgent_markers: AhoCorasick,
    /// Lowercased stems for the memchr pre-check. A description containing
    /// none of these cannot match any type set, so we skip the automatons.
    prefilter_stems: Vec<String>,
}

impl Classifier {
    /// Compile every configured keyword list. Empty lists are a
    /// configuration error — a classifier that can't classify anything is
    /// a very expensive no-op.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        let sets: [(&str, ChangeType, &Vec<String>); 5] = [
            ("motion", ChangeType::MotionFiled, &config.motion_keywords),
            ("order", ChangeType::OrderEntered, &config.order_keywords),
            ("judgment", ChangeType::JudgmentEntered, &config.judgment_keywords),
            ("hearing", ChangeType::HearingScheduled, &config.hearing_keywords),
            ("deadline", ChangeType::DeadlineSet, &config.deadline_keywords),
        ];

        let mut type_sets = Vec::with_capacity(sets.len());
        let mut prefilter_stems = Vec::new();
        for (name, change_type, keywords) in sets {
            if keywords.is_empty() {
                return Err(MonitorError::Configuration(format!(
                    "keyword set '{name}' is empty"
                )));
            }
            type_sets.push(TypeSet {
                change_type,
                automaton: build_automaton(name, keywords)?,
            });
            // The stem is the first word of each keyword — enough for the
            // bouncer to rule a description in or out cheaply.
            for kw in keywords {
                if let Some(stem) = kw.split_whitespace().next() {
                    let stem = stem.to_lowercase();
                    if !prefilter_stems.contains(&stem) {
                        prefilter_stems.push(stem);
                    }
                }
            }
        }

        Ok(Self {
            type_sets,
            urgent: build_automaton("urgent", &config.urgent_keywords)?,
            decisive: build_automaton("decisive", &config.decisive_keywords)?,
            urgent_markers: build_automaton("urgent_markers", &config.urgent_case_markers)?,
            prefilter_stems,
        })
    }

    /// The "should I even bother?" check. SIMD substring scans over the
    /// lowercased text; if no stem from any type set appears, the full
    /// automaton pass cannot produce a classification and we skip it.
    ///
    /// Never use this to skip *change detection* — only classification.
    /// A hash mismatch is a hash mismatch whether or not the text looks
    /// interesting.
    pub fn quick_relevance_check(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let haystack = lower.as_bytes();
        self.prefilter_stems
            .iter()
            .any(|stem| memchr::memmem::find(haystack, stem.as_bytes()).is_some())
    }

    /// Classify a docket description against the five type sets.
    ///
    /// A description may match multiple sets ("ORDER setting hearing" is
    /// both an order and a hearing) and yields one change type per matching
    /// set, in fixed set order. No match returns an empty vec and the
    /// caller falls back to the generic new-entry type.
    pub fn classify(&self, description: &str) -> Vec<ChangeType> {
        if description.is_empty() || !self.quick_relevance_check(description) {
            return Vec::new();
        }

        let matched: Vec<ChangeType> = self
            .type_sets
            .iter()
            .filter(|set| set.automaton.is_match(description))
            .map(|set| set.change_type)
            .collect();

        if !matched.is_empty() {
            debug!(
                types = matched.len(),
                text = %truncate(description, 80),
                "Docket text classified"
            );
        }
        matched
    }

    /// Classify a pile of descriptions in parallel. Forty new entries on
    /// an eight-core machine is exactly the workload rayon was born for.
    pub fn batch_classify(&self, descriptions: &[&str]) -> Vec<Vec<ChangeType>> {
        descriptions
            .par_iter()
            .map(|text| self.classify(text))
            .collect()
    }

    /// Deterministic severity assignment:
    ///
    /// 1. Start from the fixed type→severity table.
    /// 2. A decisive keyword ("granted", "denied", ...) bumps exactly one
    ///    level up Low<Medium<High<Critical, capped at Critical.
    /// 3. An urgent keyword ("emergency", "TRO", ...) forces Urgent,
    ///    trumping everything above.
    ///
    /// "ORDER granting summary judgment" therefore lands on Critical:
    /// base Critical, decisive bump capped, no urgent keyword present.
    pub fn severity_for(&self, change_type: ChangeType, description: &str) -> Severity {
        let mut severity = change_type.base_severity();
        if word_bounded_match(&self.decisive, description) {
            severity = severity.bump_decisive();
        }
        if word_bounded_match(&self.urgent, description) {
            severity = Severity::Urgent;
        }
        severity
    }

    /// Whether a case's title or tags carry an urgent marker. The
    /// scheduler subtracts 2 from the priority score for these.
    pub fn is_urgent_case(&self, title: Option<&str>, tags: &[String]) -> bool {
        if let Some(t) = title {
            if self.urgent_markers.is_match(t) {
                return true;
            }
        }
        tags.iter().any(|tag| self.urgent_markers.is_match(tag))
    }
}

/// Build one case-insensitive automaton, translating builder failure into
/// a configuration error (the only way this fails is a pathological
/// keyword list, which is by definition a config problem).
fn build_automaton(name: &str, keywords: &[String]) -> Result<AhoCorasick, MonitorError> {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(keywords)
        .map_err(|e| MonitorError::Configuration(format!("bad keyword set '{name}': {e}")))
}

/// Substring matching with word boundaries on both ends. The severity
/// lists contain short tokens ("tro", "granted") that must not fire inside
/// longer words — "electronic" contains "tro" and nobody needs an Urgent
/// alert about an electronic filing receipt. The type sets keep plain
/// substring semantics so "motion" still covers "motions".
fn word_bounded_match(automaton: &AhoCorasick, text: &str) -> bool {
    let bytes = text.as_bytes();
    automaton.find_iter(text).any(|m| {
        let before_ok = m.start() == 0 || !bytes[m.start() - 1].is_ascii_alphanumeric();
        let after_ok = m.end() == bytes.len() || !bytes[m.end()].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::from_config(&Config::from_env()).expect("default config must compile")
    }

    #[test]
    fn test_motion_classifies_high() {
        let c = classifier();
        let types = c.classify("Motion to Dismiss filed");
        assert_eq!(types, vec![ChangeType::MotionFiled]);
        assert_eq!(
            c.severity_for(ChangeType::MotionFiled, "Motion to Dismiss filed"),
            Severity::High
        );
    }

    #[test]
    fn test_order_granting_summary_judgment_stays_critical() {
        let c = classifier();
        let text = "ORDER granting summary judgment";
        // Only the order set matches — the judgment set is phrase-level
        // disjoint and "summary judgment" alone is not a judgment entry.
        let types = c.classify(text);
        assert_eq!(types, vec![ChangeType::OrderEntered]);
        // Base Critical, decisive bump capped at Critical, no urgent word.
        assert_eq!(
            c.severity_for(ChangeType::OrderEntered, text),
            Severity::Critical
        );
    }

    #[test]
    fn test_urgent_keyword_forces_urgent() {
        let c = classifier();
        let text = "Emergency motion for temporary restraining order";
        let types = c.classify(text);
        assert!(types.contains(&ChangeType::MotionFiled));
        assert_eq!(
            c.severity_for(ChangeType::MotionFiled, text),
            Severity::Urgent
        );
    }

    #[test]
    fn test_decisive_bumps_one_level() {
        let c = classifier();
        // Hearing base is High; "denied" bumps to Critical.
        assert_eq!(
            c.severity_for(ChangeType::HearingScheduled, "Hearing on motion denied"),
            Severity::Critical
        );
        // Medium base bumps to High.
        assert_eq!(
            c.severity_for(ChangeType::NewEntry, "Request denied by clerk"),
            Severity::High
        );
    }

    #[test]
    fn test_judgment_base_is_urgent() {
        let c = classifier();
        let text = "Final judgment entered in favor of plaintiff";
        let types = c.classify(text);
        assert!(types.contains(&ChangeType::JudgmentEntered));
        assert_eq!(
            c.severity_for(ChangeType::JudgmentEntered, text),
            Severity::Urgent
        );
    }

    #[test]
    fn test_multiple_sets_yield_multiple_types() {
        let c = classifier();
        let types = c.classify("ORDER setting hearing for March 3, response due by February 20");
        assert!(types.contains(&ChangeType::OrderEntered));
        assert!(types.contains(&ChangeType::HearingScheduled));
        assert!(types.contains(&ChangeType::DeadlineSet));
    }

    #[test]
    fn test_unremarkable_text_classifies_nothing() {
        let c = classifier();
        assert!(c.classify("Certificate of service by mail").is_empty());
        assert!(c.classify("").is_empty());
    }

    #[test]
    fn test_batch_classify_matches_serial() {
        let c = classifier();
        let texts = vec![
            "Motion for extension of time",
            "Certificate of service",
            "ORDER granting motion to seal",
        ];
        let batch = c.batch_classify(&texts);
        assert_eq!(batch.len(), 3);
        for (text, expected) in texts.iter().zip(&batch) {
            assert_eq!(&c.classify(text), expected);
        }
    }

    #[test]
    fn test_urgent_tokens_respect_word_boundaries() {
        let c = classifier();
        // "electronic" contains "tro"; boundaries keep it from going Urgent.
        assert_eq!(
            c.severity_for(ChangeType::NewEntry, "Electronic filing receipt"),
            Severity::Medium
        );
        // A real TRO as its own word still fires.
        assert_eq!(
            c.severity_for(ChangeType::MotionFiled, "Motion for TRO filed"),
            Severity::Urgent
        );
    }

    #[test]
    fn test_urgent_case_markers() {
        let c = classifier();
        assert!(c.is_urgent_case(Some("Smith v. MegaCorp (EXPEDITED)"), &[]));
        assert!(c.is_urgent_case(None, &["class action".to_string()]));
        assert!(!c.is_urgent_case(Some("Smith v. Jones"), &["contract".to_string()]));
    }
}
