// =============================================================================
// detector.rs — THE DELTA FORENSICS LAB
// =============================================================================
//
// Two snapshots walk in. A list of classified, severity-tagged changes
// walks out. This module is the reason the whole engine exists: everything
// else is just plumbing to get two snapshots into the same room.
//
// The protocol has two tiers, like airport security:
//
// 1. `quick_check` — a SHA-256 fingerprint over a sorted, minimal
//    projection of the entries. Cheap, constant-shape, and deliberately
//    boring. Any mismatch means a full analysis MUST follow. We never
//    skip the hash to "save time" — a false negative here silently drops
//    a change, and silently dropped changes are how law firms end up on
//    the news.
//
// 2. `analyze` — the full pat-down. Entry-number maps for old vs. new,
//    added/modified/removed sets, field-by-field comparison on modified
//    entries, and a separate diff of the case-level metadata.
// =============================================================================

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::classifier::Classifier;
use crate::models::{
    CaseInfo, ChangeDetection, ChangeType, DocketEntry, MonitoredCase, Snapshot,
};
use std::collections::{BTreeMap, HashMap};

/// The result of a full delta analysis: every detected change, the counts
/// that feed metrics, and the fresh hash to cache for next time.
#[derive(Debug)]
pub struct DeltaAnalysis {
    pub changes: Vec<ChangeDetection>,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub new_hash: String,
}

impl DeltaAnalysis {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Compute the stable fingerprint of a set of docket entries.
///
/// The projection is minimal on purpose: entry number, description, filed
/// date, and document-link *count*. Sorted by entry number via BTreeMap so
/// the portal returning entries in a different order doesn't read as a
/// change. Anything in this projection changing flips the hash; anything
/// outside it (like the link URLs themselves reshuffling) doesn't.
pub fn compute_snapshot_hash(entries: &[DocketEntry]) -> String {
    let sorted: BTreeMap<u32, &DocketEntry> =
        entries.iter().map(|e| (e.entry_number, e)).collect();

    let mut hasher = Sha256::new();
    for (number, entry) in sorted {
        hasher.update(number.to_le_bytes());
        hasher.update(entry.description.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(
            entry
                .filed_date
                .map(|d| d.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(b"\x1f");
        hasher.update((entry.document_links.len() as u64).to_le_bytes());
        hasher.update(b"\x1e");
    }
    format!("{:x}", hasher.finalize())
}

/// The cheap short-circuit: true iff the fresh entries hash differently
/// than the cached snapshot. True means "go do the full analysis, now."
pub fn quick_check(case: &MonitoredCase, fresh_entries: &[DocketEntry]) -> bool {
    compute_snapshot_hash(fresh_entries) != case.cached_hash
}

/// Full delta analysis between a case's cached snapshot and a fresh one.
///
/// Entry-level: lookup maps keyed by entry number give us added, removed,
/// and candidate-modified sets; modified candidates are compared field by
/// field (description, filed date, document-link count). Metadata-level:
/// judge, status, and parties each diff into their own dedicated change
/// type, with close/reopen getting special treatment because "Closed" is
/// not just another status string to the people billing against the case.
pub fn analyze(
    case: &MonitoredCase,
    snapshot: &Snapshot,
    classifier: &Classifier,
) -> DeltaAnalysis {
    let old_by_number: HashMap<u32, &DocketEntry> = case
        .cached_entries
        .iter()
        .map(|e| (e.entry_number, e))
        .collect();
    let new_by_number: HashMap<u32, &DocketEntry> = snapshot
        .entries
        .iter()
        .map(|e| (e.entry_number, e))
        .collect();

    let mut changes: Vec<ChangeDetection> = Vec::new();
    let mut added = 0usize;
    let mut modified = 0usize;
    let mut removed = 0usize;

    // Added + modified. Iterate the fresh snapshot in entry order so the
    // output is deterministic — tests and humans both appreciate that.
    let mut fresh_sorted: Vec<&DocketEntry> = snapshot.entries.iter().collect();
    fresh_sorted.sort_by_key(|e| e.entry_number);

    for entry in fresh_sorted {
        match old_by_number.get(&entry.entry_number) {
            None => {
                added += 1;
                changes.extend(classify_entry(
                    case,
                    snapshot,
                    entry,
                    ChangeType::NewEntry,
                    classifier,
                ));
            }
            Some(old) => {
                let mut entry_changed = false;

                if old.description != entry.description {
                    entry_changed = true;
                    // A rewritten description gets re-classified: the new
                    // text may now be an order where it used to be a
                    // placeholder.
                    let mut classified = classify_entry(
                        case,
                        snapshot,
                        entry,
                        ChangeType::EntryModified,
                        classifier,
                    );
                    for change in &mut classified {
                        change.old_value = Some(old.description.clone());
                    }
                    changes.extend(classified);
                }

                if old.filed_date != entry.filed_date {
                    entry_changed = true;
                    let mut change = base_change(case, snapshot, entry, ChangeType::EntryModified);
                    change.old_value = Some(
                        old.filed_date.map(|d| d.to_string()).unwrap_or_default(),
                    );
                    change.new_value = Some(
                        entry.filed_date.map(|d| d.to_string()).unwrap_or_default(),
                    );
                    change.description =
                        format!("Filed date changed on entry #{}", entry.entry_number);
                    changes.push(change);
                }

                if old.document_links.len() != entry.document_links.len() {
                    entry_changed = true;
                    let mut change = base_change(case, snapshot, entry, ChangeType::NewDocument);
                    change.old_value = Some(old.document_links.len().to_string());
                    change.new_value = Some(entry.document_links.len().to_string());
                    change.description = format!(
                        "Document count on entry #{} went {} -> {}: {}",
                        entry.entry_number,
                        old.document_links.len(),
                        entry.document_links.len(),
                        entry.description
                    );
                    changes.push(change);
                }

                if entry_changed {
                    modified += 1;
                }
            }
        }
    }

    // Removed. Entries disappearing off a public docket is rare and weird,
    // which is exactly why it gets its own change instead of silence.
    let mut old_sorted: Vec<&DocketEntry> = case.cached_entries.iter().collect();
    old_sorted.sort_by_key(|e| e.entry_number);
    for entry in old_sorted {
        if !new_by_number.contains_key(&entry.entry_number) {
            removed += 1;
            let mut change = base_change(case, snapshot, entry, ChangeType::EntryRemoved);
            change.old_value = Some(entry.description.clone());
            change.description =
                format!("Entry #{} removed from docket: {}", entry.entry_number, entry.description);
            changes.push(change);
        }
    }

    // Case-level metadata. Each field diffs into its own change type.
    changes.extend(diff_case_info(case, snapshot));

    let new_hash = compute_snapshot_hash(&snapshot.entries);

    debug!(
        monitor_id = %case.monitor_id,
        case_number = %case.case_number,
        added,
        modified,
        removed,
        changes = changes.len(),
        "Delta analysis complete"
    );

    DeltaAnalysis {
        changes,
        added,
        modified,
        removed,
        new_hash,
    }
}

/// Classify one entry's description into zero or more typed changes.
/// One change per matching keyword set; no keyword match falls back to
/// `fallback` (NewEntry or EntryModified) — an unclassified change is
/// still a change.
fn classify_entry(
    case: &MonitoredCase,
    snapshot: &Snapshot,
    entry: &DocketEntry,
    fallback: ChangeType,
    classifier: &Classifier,
) -> Vec<ChangeDetection> {
    let mut matched = classifier.classify(&entry.description);
    if matched.is_empty() {
        matched.push(fallback);
    }
    matched
        .into_iter()
        .map(|change_type| {
            let mut change = base_change(case, snapshot, entry, change_type);
            change.severity = classifier.severity_for(change_type, &entry.description);
            change.new_value = Some(entry.description.clone());
            change
        })
        .collect()
}

/// Common scaffolding for a change on a specific entry.
fn base_change(
    case: &MonitoredCase,
    snapshot: &Snapshot,
    entry: &DocketEntry,
    change_type: ChangeType,
) -> ChangeDetection {
    let mut change = ChangeDetection::new(
        case.monitor_id,
        case.case_number.clone(),
        case.source_id.clone(),
        change_type,
        change_type.base_severity(),
        entry.description.clone(),
    );
    change.entry_number = Some(entry.entry_number);
    change.court = snapshot.case_info.court.clone();
    change
}

/// Diff the case-level metadata: judge, status, parties. Status gets the
/// close/reopen special-casing; everything else is a straight old/new diff.
fn diff_case_info(case: &MonitoredCase, snapshot: &Snapshot) -> Vec<ChangeDetection> {
    let old = &case.cached_case_info;
    let new = &snapshot.case_info;
    let mut changes = Vec::new();

    let mut metadata_change = |change_type: ChangeType,
                               description: String,
                               old_value: Option<String>,
                               new_value: Option<String>| {
        let mut change = ChangeDetection::new(
            case.monitor_id,
            case.case_number.clone(),
            case.source_id.clone(),
            change_type,
            change_type.base_severity(),
            description,
        );
        change.old_value = old_value;
        change.new_value = new_value;
        change.court = new.court.clone();
        change
    };

    if old.judge != new.judge {
        changes.push(metadata_change(
            ChangeType::JudgeChange,
            format!(
                "Presiding judge changed from {} to {}",
                old.judge.as_deref().unwrap_or("(unassigned)"),
                new.judge.as_deref().unwrap_or("(unassigned)")
            ),
            old.judge.clone(),
            new.judge.clone(),
        ));
    }

    if old.status != new.status {
        let was_closed = old
            .status
            .as_deref()
            .map(CaseInfo::is_closed_status)
            .unwrap_or(false);
        let is_closed = new
            .status
            .as_deref()
            .map(CaseInfo::is_closed_status)
            .unwrap_or(false);

        let change_type = match (was_closed, is_closed) {
            (false, true) => ChangeType::CaseClosed,
            (true, false) => ChangeType::CaseReopened,
            _ => ChangeType::CaseStatusChange,
        };
        changes.push(metadata_change(
            change_type,
            format!(
                "Case status changed from {} to {}",
                old.status.as_deref().unwrap_or("(none)"),
                new.status.as_deref().unwrap_or("(none)")
            ),
            old.status.clone(),
            new.status.clone(),
        ));
    }

    if old.parties != new.parties {
        changes.push(metadata_change(
            ChangeType::PartyChange,
            format!(
                "Party roster changed ({} -> {} parties)",
                old.parties.len(),
                new.parties.len()
            ),
            Some(old.parties.join("; ")),
            Some(new.parties.join("; ")),
        ));
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{PollFrequency, Severity};
    use chrono::{NaiveDate, Utc};

    fn entry(number: u32, description: &str, links: usize) -> DocketEntry {
        DocketEntry {
            entry_number: number,
            description: description.to_string(),
            filed_date: NaiveDate::from_ymd_opt(2024, 1, 15),
            document_links: (0..links)
                .map(|i| format!("https://portal/doc/{number}/{i}"))
                .collect(),
        }
    }

    fn snapshot(entries: Vec<DocketEntry>) -> Snapshot {
        Snapshot {
            entries,
            case_info: CaseInfo {
                judge: Some("Hon. A. Example".into()),
                status: Some("Open".into()),
                parties: vec!["Smith".into(), "MegaCorp".into()],
                court: Some("D. Example".into()),
            },
            cost_cents: 30,
            fetched_at: Utc::now(),
        }
    }

    fn seeded_case(entries: Vec<DocketEntry>, info: CaseInfo) -> MonitoredCase {
        let mut case = MonitoredCase::new("2:24-cv-0001", "pacer", PollFrequency::Every15Min, 3);
        case.cached_hash = compute_snapshot_hash(&entries);
        case.cached_entries = entries;
        case.cached_case_info = info;
        case
    }

    fn classifier() -> Classifier {
        Classifier::from_config(&Config::from_env()).expect("default config must compile")
    }

    #[test]
    fn test_hash_is_order_independent() {
        let a = vec![entry(1, "Complaint", 1), entry(2, "Summons issued", 0)];
        let b = vec![entry(2, "Summons issued", 0), entry(1, "Complaint", 1)];
        assert_eq!(compute_snapshot_hash(&a), compute_snapshot_hash(&b));
    }

    #[test]
    fn test_quick_check_true_iff_projection_differs() {
        let entries = vec![entry(1, "Complaint", 1), entry(2, "Summons issued", 0)];
        let case = seeded_case(entries.clone(), CaseInfo::default());

        // Identical entries: no change.
        assert!(!quick_check(&case, &entries));

        // Each hashed field flips the hash — no false negatives allowed.
        let mut desc_changed = entries.clone();
        desc_changed[0].description = "Amended complaint".into();
        assert!(quick_check(&case, &desc_changed));

        let mut date_changed = entries.clone();
        date_changed[1].filed_date = NaiveDate::from_ymd_opt(2024, 2, 1);
        assert!(quick_check(&case, &date_changed));

        let mut links_changed = entries.clone();
        links_changed[0].document_links.push("https://portal/doc/1/9".into());
        assert!(quick_check(&case, &links_changed));

        let mut entry_added = entries;
        entry_added.push(entry(3, "Answer filed", 0));
        assert!(quick_check(&case, &entry_added));
    }

    #[test]
    fn test_new_motion_entry_detected_high() {
        // The canonical scenario: two entries cached, a fresh fetch returns
        // three, #3 is a motion.
        let cached = vec![entry(1, "Complaint", 1), entry(2, "Summons issued", 0)];
        let case = seeded_case(cached.clone(), snapshot(vec![]).case_info);

        let mut fresh = cached;
        fresh.push(entry(3, "Motion to Dismiss filed", 1));
        let snap = snapshot(fresh);

        assert!(quick_check(&case, &snap.entries));
        let analysis = analyze(&case, &snap, &classifier());

        assert_eq!(analysis.added, 1);
        assert_eq!(analysis.modified, 0);
        assert_eq!(analysis.removed, 0);
        assert_eq!(analysis.changes.len(), 1);

        let change = &analysis.changes[0];
        assert_eq!(change.change_type, ChangeType::MotionFiled);
        assert_eq!(change.severity, Severity::High);
        assert_eq!(change.entry_number, Some(3));
    }

    #[test]
    fn test_unclassified_new_entry_falls_back_to_generic() {
        let cached = vec![entry(1, "Complaint", 1)];
        let case = seeded_case(cached.clone(), snapshot(vec![]).case_info);

        let mut fresh = cached;
        fresh.push(entry(2, "Certificate of service by mail", 0));
        let analysis = analyze(&case, &snapshot(fresh), &classifier());

        assert_eq!(analysis.changes.len(), 1);
        assert_eq!(analysis.changes[0].change_type, ChangeType::NewEntry);
        assert_eq!(analysis.changes[0].severity, Severity::Medium);
    }

    #[test]
    fn test_modified_description_carries_old_value() {
        let cached = vec![entry(1, "Placeholder docket text", 0)];
        let case = seeded_case(cached, snapshot(vec![]).case_info);

        let fresh = vec![entry(1, "ORDER granting motion to compel", 0)];
        let analysis = analyze(&case, &snapshot(fresh), &classifier());

        assert_eq!(analysis.modified, 1);
        let change = &analysis.changes[0];
        // Rewritten text re-classifies: this is now an order.
        assert_eq!(change.change_type, ChangeType::OrderEntered);
        assert_eq!(change.old_value.as_deref(), Some("Placeholder docket text"));
    }

    #[test]
    fn test_new_document_link_is_its_own_change() {
        let cached = vec![entry(1, "Complaint", 1)];
        let case = seeded_case(cached, snapshot(vec![]).case_info);

        let fresh = vec![entry(1, "Complaint", 2)];
        let analysis = analyze(&case, &snapshot(fresh), &classifier());

        assert_eq!(analysis.changes.len(), 1);
        let change = &analysis.changes[0];
        assert_eq!(change.change_type, ChangeType::NewDocument);
        assert_eq!(change.old_value.as_deref(), Some("1"));
        assert_eq!(change.new_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_removed_entry_detected() {
        let cached = vec![entry(1, "Complaint", 1), entry(2, "Summons issued", 0)];
        let case = seeded_case(cached, snapshot(vec![]).case_info);

        let fresh = vec![entry(1, "Complaint", 1)];
        let analysis = analyze(&case, &snapshot(fresh), &classifier());

        assert_eq!(analysis.removed, 1);
        assert_eq!(analysis.changes.len(), 1);
        assert_eq!(analysis.changes[0].change_type, ChangeType::EntryRemoved);
    }

    #[test]
    fn test_metadata_diffs_produce_dedicated_types() {
        let cached = vec![entry(1, "Complaint", 1)];
        let mut old_info = snapshot(vec![]).case_info;
        old_info.judge = Some("Hon. B. Predecessor".into());
        old_info.parties = vec!["Smith".into()];
        let case = seeded_case(cached.clone(), old_info);

        let snap = snapshot(cached); // judge "Hon. A. Example", two parties
        let analysis = analyze(&case, &snap, &classifier());

        let types: Vec<ChangeType> = analysis.changes.iter().map(|c| c.change_type).collect();
        assert!(types.contains(&ChangeType::JudgeChange));
        assert!(types.contains(&ChangeType::PartyChange));
        assert!(!types.contains(&ChangeType::CaseStatusChange));
    }

    #[test]
    fn test_close_and_reopen_transitions() {
        let cached = vec![entry(1, "Complaint", 1)];
        let case = seeded_case(cached.clone(), snapshot(vec![]).case_info);

        let mut closing = snapshot(cached.clone());
        closing.case_info.status = Some("Closed".into());
        let analysis = analyze(&case, &closing, &classifier());
        assert!(analysis
            .changes
            .iter()
            .any(|c| c.change_type == ChangeType::CaseClosed));

        // Now the other direction.
        let mut closed_info = snapshot(vec![]).case_info;
        closed_info.status = Some("Terminated".into());
        let closed_case = seeded_case(cached.clone(), closed_info);
        let reopened = snapshot(cached);
        let analysis = analyze(&closed_case, &reopened, &classifier());
        assert!(analysis
            .changes
            .iter()
            .any(|c| c.change_type == ChangeType::CaseReopened));
    }

    #[test]
    fn test_identical_snapshots_yield_no_changes() {
        let cached = vec![entry(1, "Complaint", 1), entry(2, "Summons issued", 0)];
        let case = seeded_case(cached.clone(), snapshot(vec![]).case_info);
        let analysis = analyze(&case, &snapshot(cached), &classifier());
        assert!(!analysis.has_changes());
        assert_eq!(analysis.new_hash, case.cached_hash);
    }
}
