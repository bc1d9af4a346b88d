use crate::errors::WeftError;
use crate::hash::hash_bytes;
use serde::{Deserialize, Serialize};
use weft_store::{StoreError, WorkspaceStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Valid,
    Drift,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCheck {
    pub path: String,
    pub status: OutputStatus,
    pub expected_hash: String,
    pub actual_hash: Option<String>,
}

/// Outcome of recomputing every receipt output hash against the files on
/// disk. Never mutates state; safe to produce at any time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub receipt_found: bool,
    pub checks: Vec<OutputCheck>,
}

impl VerificationReport {
    pub fn drift_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|check| check.status == OutputStatus::Drift)
            .count()
    }

    pub fn missing_count(&self) -> usize {
        self.checks
            .iter()
            .filter(|check| check.status == OutputStatus::Missing)
            .count()
    }

    pub fn is_valid(&self) -> bool {
        self.checks
            .iter()
            .all(|check| check.status == OutputStatus::Valid)
    }
}

/// Read-only drift detector. `strict` escalates an invalid report to a
/// `Drift` error for CI-style callers; the report itself is always
/// returned intact through the error-free path first.
pub struct Verifier {
    store: WorkspaceStore,
}

impl Verifier {
    pub fn new(store: WorkspaceStore) -> Self {
        Self { store }
    }

    pub fn verify(&self) -> Result<VerificationReport, WeftError> {
        let receipt = match self.store.load_receipt() {
            Ok(receipt) => receipt,
            Err(StoreError::Serialization(detail)) => {
                return Err(WeftError::Io(format!("receipt unreadable: {detail}")));
            }
            Err(error) => return Err(error.into()),
        };

        let Some(receipt) = receipt else {
            // Nothing has been generated yet; an empty workspace is not
            // drifted.
            return Ok(VerificationReport {
                receipt_found: false,
                checks: Vec::new(),
            });
        };

        let mut checks = Vec::new();
        for (path, expected_hash) in &receipt.outputs {
            let check = match self.store.read_output(path)? {
                None => OutputCheck {
                    path: path.clone(),
                    status: OutputStatus::Missing,
                    expected_hash: expected_hash.clone(),
                    actual_hash: None,
                },
                Some(bytes) => {
                    let actual = hash_bytes(&bytes);
                    let status = if &actual == expected_hash {
                        OutputStatus::Valid
                    } else {
                        OutputStatus::Drift
                    };
                    OutputCheck {
                        path: path.clone(),
                        status,
                        expected_hash: expected_hash.clone(),
                        actual_hash: Some(actual),
                    }
                }
            };
            checks.push(check);
        }

        Ok(VerificationReport {
            receipt_found: true,
            checks,
        })
    }

    pub fn verify_strict(&self) -> Result<VerificationReport, WeftError> {
        let report = self.verify()?;
        let failing = report.drift_count() + report.missing_count();
        if failing > 0 {
            return Err(WeftError::Drift { count: failing });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_store::Receipt;

    fn store_with_receipt(outputs: &[(&str, &[u8])]) -> (tempfile::TempDir, WorkspaceStore) {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = WorkspaceStore::open(tmp.path()).expect("store should open");
        let mut receipt = Receipt::new("0.1.0");
        for (path, bytes) in outputs {
            store.write_output(path, bytes).expect("output should write");
            receipt
                .outputs
                .insert((*path).to_string(), hash_bytes(bytes));
        }
        store.save_receipt(&receipt).expect("receipt should save");
        (tmp, store)
    }

    #[test]
    fn verify_untouched_outputs_expected_all_valid() {
        let (_tmp, store) = store_with_receipt(&[("gen/a.md", b"alpha\n"), ("gen/b.md", b"beta\n")]);

        let report = Verifier::new(store).verify().expect("verify should run");

        assert!(report.receipt_found);
        assert!(report.is_valid());
        assert_eq!(report.checks.len(), 2);
    }

    #[test]
    fn verify_single_byte_edit_expected_exactly_that_path_drifted() {
        let (_tmp, store) = store_with_receipt(&[("gen/a.md", b"alpha\n"), ("gen/b.md", b"beta\n")]);
        store
            .write_output("gen/a.md", b"alphA\n")
            .expect("mutation should write");

        let report = Verifier::new(store).verify().expect("verify should run");

        assert_eq!(report.drift_count(), 1);
        let drifted: Vec<&str> = report
            .checks
            .iter()
            .filter(|check| check.status == OutputStatus::Drift)
            .map(|check| check.path.as_str())
            .collect();
        assert_eq!(drifted, vec!["gen/a.md"]);
        assert_eq!(
            report
                .checks
                .iter()
                .filter(|check| check.status == OutputStatus::Valid)
                .count(),
            1
        );
    }

    #[test]
    fn verify_deleted_output_expected_missing() {
        let (tmp, store) = store_with_receipt(&[("gen/a.md", b"alpha\n")]);
        std::fs::remove_file(tmp.path().join("gen/a.md")).expect("delete should succeed");

        let report = Verifier::new(store).verify().expect("verify should run");

        assert_eq!(report.missing_count(), 1);
        assert!(!report.is_valid());
    }

    #[test]
    fn verify_no_receipt_expected_empty_valid_report() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let store = WorkspaceStore::open(tmp.path()).expect("store should open");

        let report = Verifier::new(store).verify().expect("verify should run");

        assert!(!report.receipt_found);
        assert!(report.is_valid());
    }

    #[test]
    fn verify_strict_with_drift_expected_drift_error() {
        let (_tmp, store) = store_with_receipt(&[("gen/a.md", b"alpha\n")]);
        store
            .write_output("gen/a.md", b"edited\n")
            .expect("mutation should write");

        let error = Verifier::new(store)
            .verify_strict()
            .expect_err("strict verify should fail");
        assert!(matches!(error, WeftError::Drift { count: 1 }));
    }
}
