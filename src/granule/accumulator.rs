//! Pending-granule table and its state machine.
//!
//! The accumulator is a plain single-threaded value. It is owned by exactly one
//! task (see [`crate::engine`]); other tasks reach it only through the event
//! queue, so it needs no locking.

use std::collections::HashMap;
use std::path::Path;

use super::completion::CompletionRule;
use super::error::AccumulateError;
use super::record::GranuleRecord;

/// Result of feeding one arrival into the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// The granule is still waiting for the listed types or flags.
    Pending { id: String, missing: Vec<String> },
    /// The granule became complete. It has been removed from the table.
    Complete(GranuleRecord),
}

/// Owns every pending granule and detects completeness.
#[derive(Debug)]
pub struct GranuleAccumulator {
    rule: CompletionRule,
    trigger_type: String,
    pending: HashMap<String, GranuleRecord>,
}

impl GranuleAccumulator {
    pub fn new(rule: CompletionRule, trigger_type: impl Into<String>) -> Self {
        Self {
            rule,
            trigger_type: trigger_type.into(),
            pending: HashMap::new(),
        }
    }

    /// Number of granules currently waiting for files.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, id: &str) -> Option<&GranuleRecord> {
        self.pending.get(id)
    }

    /// Record that `path`, classified as `type_name`, arrived for granule `id`.
    ///
    /// A repeated type is reported as [`AccumulateError::DuplicateType`] and
    /// leaves the record untouched. When the completeness rule holds, the record
    /// is removed in the same call and returned as [`Arrival::Complete`].
    pub fn accept(
        &mut self,
        type_name: &str,
        id: &str,
        path: &Path,
    ) -> Result<Arrival, AccumulateError> {
        let mut incoming = GranuleRecord::new(id);
        incoming.satisfied_types.insert(type_name.to_string());
        incoming.ancillary_flags.extend(
            self.rule
                .flags_raised_by(type_name)
                .map(|f| f.to_string()),
        );
        if type_name == self.trigger_type {
            incoming.trigger_file = Some(path.to_path_buf());
        }

        let record = self
            .pending
            .entry(id.to_string())
            .or_insert_with(|| GranuleRecord::new(id));

        if record.has_type(type_name) {
            return Err(AccumulateError::DuplicateType {
                id: id.to_string(),
                type_name: type_name.to_string(),
            });
        }
        record.merge(incoming)?;

        if self.rule.is_complete(record) {
            let complete = self
                .pending
                .remove(id)
                .unwrap_or_else(|| GranuleRecord::new(id));
            return Ok(Arrival::Complete(complete));
        }

        Ok(Arrival::Pending {
            id: id.to_string(),
            missing: self.rule.missing(record),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const VIIRS: [&str; 11] = [
        "GMTCO", "IICMO", "SVDNB", "SVM07", "SVM08", "SVM10", "SVM12", "SVM13", "SVM14", "SVM15",
        "SVM16",
    ];

    fn path_for(type_name: &str) -> PathBuf {
        PathBuf::from(format!("/in/{type_name}_g1.h5"))
    }

    fn feed(acc: &mut GranuleAccumulator, types: &[&str]) -> Vec<GranuleRecord> {
        let mut completed = Vec::new();
        for t in types {
            if let Ok(Arrival::Complete(r)) = acc.accept(t, "g1", &path_for(t)) {
                completed.push(r);
            }
        }
        completed
    }

    /// Heap's algorithm, collecting every ordering of `items`.
    fn permutations(items: &[&'static str]) -> Vec<Vec<&'static str>> {
        fn heap(k: usize, items: &mut Vec<&'static str>, out: &mut Vec<Vec<&'static str>>) {
            if k == 1 {
                out.push(items.clone());
                return;
            }
            heap(k - 1, items, out);
            for i in 0..k - 1 {
                if k % 2 == 0 {
                    items.swap(i, k - 1);
                } else {
                    items.swap(0, k - 1);
                }
                heap(k - 1, items, out);
            }
        }
        let mut items = items.to_vec();
        let mut out = Vec::new();
        heap(items.len(), &mut items, &mut out);
        out
    }

    #[test]
    fn test_completes_once_in_any_arrival_order() {
        let types = ["SVM10", "SVM07", "GMTCO", "IICMO"];
        for order in permutations(&types) {
            let mut acc = GranuleAccumulator::new(
                CompletionRule::types(["SVM10", "SVM07"]).with_flags([("geo", "GMTCO"), ("cloud", "IICMO")]),
                "SVM10",
            );
            let completed = feed(&mut acc, &order);
            assert_eq!(completed.len(), 1, "order {order:?}");
            let record = &completed[0];
            assert_eq!(record.trigger_file, Some(path_for("SVM10")));
            assert_eq!(record.satisfied_types.len(), 4);
            assert_eq!(acc.pending_count(), 0);
        }
    }

    #[test]
    fn test_completion_happens_on_last_required_arrival() {
        let mut acc = GranuleAccumulator::new(CompletionRule::types(VIIRS), "SVM10");
        for (i, t) in VIIRS.iter().enumerate() {
            let arrival = acc.accept(t, "g1", &path_for(t)).unwrap();
            if i + 1 < VIIRS.len() {
                match arrival {
                    Arrival::Pending { missing, .. } => assert_eq!(missing.len(), VIIRS.len() - i - 1),
                    Arrival::Complete(_) => panic!("completed early after {t}"),
                }
            } else {
                assert!(matches!(arrival, Arrival::Complete(_)));
            }
        }
    }

    #[test]
    fn test_duplicate_type_is_reported_and_state_kept() {
        let mut acc = GranuleAccumulator::new(CompletionRule::types(["SVM10", "SVM07"]), "SVM10");
        acc.accept("SVM10", "g1", Path::new("/in/a.h5")).unwrap();

        let err = acc.accept("SVM10", "g1", Path::new("/in/b.h5")).unwrap_err();
        assert!(err.is_benign());
        let record = acc.pending("g1").unwrap();
        assert_eq!(record.trigger_file, Some(PathBuf::from("/in/a.h5")));
        assert_eq!(record.satisfied_types.len(), 1);
    }

    #[test]
    fn test_duplicates_after_completion_never_complete_again() {
        let mut acc = GranuleAccumulator::new(CompletionRule::types(["SVM10", "SVM07"]), "SVM10");
        let first = feed(&mut acc, &["SVM10", "SVM07"]);
        assert_eq!(first.len(), 1);

        // A late duplicate starts a fresh pending record but cannot complete it alone
        let late = feed(&mut acc, &["SVM07"]);
        assert!(late.is_empty());
        assert_eq!(acc.pending_count(), 1);
    }

    #[test]
    fn test_granules_are_independent() {
        let mut acc = GranuleAccumulator::new(CompletionRule::types(["SVM10", "SVM07"]), "SVM10");
        acc.accept("SVM10", "g1", Path::new("/in/g1_m10.h5")).unwrap();
        acc.accept("SVM10", "g2", Path::new("/in/g2_m10.h5")).unwrap();
        assert_eq!(acc.pending_count(), 2);

        let arrival = acc.accept("SVM07", "g2", Path::new("/in/g2_m07.h5")).unwrap();
        match arrival {
            Arrival::Complete(r) => {
                assert_eq!(r.id, "g2");
                assert_eq!(r.trigger_file, Some(PathBuf::from("/in/g2_m10.h5")));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(acc.pending("g1").is_some());
    }

    #[test]
    fn test_non_required_types_are_recorded() {
        let mut acc = GranuleAccumulator::new(CompletionRule::types(["SVM10"]), "SVM10");
        let arrival = acc.accept("SVI01", "g1", Path::new("/in/i1.h5")).unwrap();
        assert!(matches!(arrival, Arrival::Pending { .. }));
        assert!(acc.pending("g1").unwrap().has_type("SVI01"));
    }
}
