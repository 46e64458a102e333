//! Verify log command implementation.

use dstate_protocol::{decode_frames, Key, Operation};
use std::collections::BTreeSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of records checked.
    pub records_checked: usize,
    /// Number of base versions checked.
    pub base_versions_checked: usize,
    /// Problems that make the log unreplayable.
    pub errors: Vec<String>,
    /// Suspicious but replayable findings.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify-log command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying log at {:?}", path);
    println!();

    let bytes = std::fs::read(path)?;
    let result = verify_bytes(&bytes);
    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Log verification passed");
        Ok(())
    } else {
        println!("✗ Log verification failed");
        Err("Verification failed".into())
    }
}

/// Checks framing, digest, and record ordering of a serialized log.
pub fn verify_bytes(bytes: &[u8]) -> VerifyResult {
    let mut result = VerifyResult::default();

    let decoded = match decode_frames(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            result.errors.push(format!("cannot decode log: {e}"));
            return result;
        }
    };
    tracing::debug!(
        cycle = %decoded.header.cycle_id,
        records = decoded.frames.len(),
        "log framing intact"
    );

    let mut created: BTreeSet<&Key> = BTreeSet::new();
    let mut removed: BTreeSet<&Key> = BTreeSet::new();
    let mut touched: BTreeSet<&Key> = BTreeSet::new();

    for (index, frame) in decoded.frames.iter().enumerate() {
        result.records_checked += 1;
        let op = &frame.operation;
        let subject = op.key();

        if removed.contains(subject) {
            result.errors.push(format!(
                "record {index} at offset {}: {} after {subject} was removed",
                frame.offset,
                op.kind().label()
            ));
        }
        match op {
            Operation::CreateEntity { key, type_tag } => {
                if key.type_tag() != *type_tag {
                    result.errors.push(format!(
                        "record {index}: {key} created as {type_tag}"
                    ));
                }
                if !created.insert(key) {
                    result
                        .errors
                        .push(format!("record {index}: {key} created twice"));
                }
                if !key.is_temporary() {
                    result.warnings.push(format!(
                        "record {index}: {key} is created under a permanent key"
                    ));
                }
            }
            Operation::RemoveEntity { key } => {
                removed.insert(key);
            }
            _ => {}
        }
        for key in op.touched_keys() {
            if key.is_temporary() && !created.contains(key) {
                result.errors.push(format!(
                    "record {index}: temporary key {key} used before its creation"
                ));
            }
            touched.insert(key);
        }
    }

    for (key, _) in &decoded.base_versions {
        result.base_versions_checked += 1;
        if created.contains(key) {
            result
                .errors
                .push(format!("base version recorded for created key {key}"));
        } else if !touched.contains(key) {
            result
                .warnings
                .push(format!("base version for {key}, which no record touches"));
        }
    }

    result
}

fn print_result(result: &VerifyResult) {
    println!("  Records checked: {}", result.records_checked);
    println!("  Base versions checked: {}", result.base_versions_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::sample_log;
    use dstate_protocol::{FieldId, FieldValue, OperationLog, TypeTag};

    #[test]
    fn intact_log_passes() {
        let result = verify_bytes(&sample_log().serialize().unwrap());
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.records_checked, 3);
        assert_eq!(result.base_versions_checked, 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn truncated_log_fails_to_decode() {
        let bytes = sample_log().serialize().unwrap();
        let result = verify_bytes(&bytes[..bytes.len() - 5]);
        assert!(!result.is_ok());
        assert_eq!(result.records_checked, 0);
    }

    #[test]
    fn use_after_remove_is_an_error() {
        let key = Key::from_id(TypeTag::new(1), 1);
        let mut log = OperationLog::new();
        log.append(Operation::RemoveEntity { key: key.clone() });
        log.append(Operation::SetField {
            key,
            field: FieldId::new(0),
            value: FieldValue::Integer(1),
        });

        let result = verify_bytes(&log.serialize().unwrap());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("after"));
    }

    #[test]
    fn temporary_key_needs_a_prior_create() {
        let temp = Key::temporary(TypeTag::new(2), vec![FieldValue::Integer(1)]);
        let mut log = OperationLog::new();
        log.append(Operation::SetField {
            key: temp.clone(),
            field: FieldId::new(0),
            value: FieldValue::Null,
        });
        log.append(Operation::CreateEntity {
            key: temp,
            type_tag: TypeTag::new(2),
        });

        let result = verify_bytes(&log.serialize().unwrap());
        assert!(!result.is_ok());
        assert!(result.errors[0].contains("before its creation"));
    }
}
