//! Dump log command implementation.

use dstate_protocol::{decode_frames, DecodedLog, Operation};
use serde::Serialize;
use std::path::Path;

/// Operation record representation for output.
#[derive(Debug, Serialize)]
pub struct RecordInfo {
    /// Position of the record in the log.
    pub index: usize,
    /// Byte offset of the record's tag.
    pub offset: usize,
    /// Operation label.
    pub kind: String,
    /// Subject key.
    pub key: String,
    /// Field (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<u16>,
    /// Assigned value or collection item (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Body size in bytes.
    pub body_len: usize,
}

/// Base version entry for output.
#[derive(Debug, Serialize)]
pub struct BaseVersionInfo {
    /// Entity key.
    pub key: String,
    /// Version the entity had when the log first touched it.
    pub version: String,
}

/// A whole log prepared for output.
#[derive(Debug, Serialize)]
pub struct LogDump {
    /// Format version from the header.
    pub format_version: u16,
    /// Cycle that produced the log.
    pub cycle_id: String,
    /// Number of operations in the log, ignoring any limit.
    pub operation_count: u32,
    /// Recorded base versions.
    pub base_versions: Vec<BaseVersionInfo>,
    /// Records, possibly truncated by a limit.
    pub records: Vec<RecordInfo>,
}

/// Runs the dump-log command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("log file not found: {}", path.display()).into());
    }

    let bytes = std::fs::read(path)?;
    let dump = read_log(&bytes, limit)?;
    tracing::debug!(
        records = dump.records.len(),
        total = dump.operation_count,
        "decoded log"
    );

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
        _ => {
            print!("{}", render_text(&dump));
        }
    }

    Ok(())
}

/// Decodes `bytes` into a printable dump holding at most `limit` records.
pub fn read_log(bytes: &[u8], limit: Option<usize>) -> Result<LogDump, Box<dyn std::error::Error>> {
    let decoded = decode_frames(bytes)?;
    Ok(summarize(&decoded, limit))
}

fn summarize(decoded: &DecodedLog, limit: Option<usize>) -> LogDump {
    let max_records = limit.unwrap_or(usize::MAX);
    let records = decoded
        .frames
        .iter()
        .take(max_records)
        .enumerate()
        .map(|(index, frame)| {
            let op = &frame.operation;
            RecordInfo {
                index,
                offset: frame.offset,
                kind: op.kind().label().to_string(),
                key: op.key().to_string(),
                field: op.field().map(|f| f.as_u16()),
                detail: detail(op),
                body_len: frame.body_len,
            }
        })
        .collect();

    LogDump {
        format_version: decoded.header.version,
        cycle_id: decoded.header.cycle_id.to_string(),
        operation_count: decoded.header.operation_count,
        base_versions: decoded
            .base_versions
            .iter()
            .map(|(key, version)| BaseVersionInfo {
                key: key.to_string(),
                version: version.to_string(),
            })
            .collect(),
        records,
    }
}

fn detail(op: &Operation) -> Option<String> {
    match op {
        Operation::CreateEntity { type_tag, .. } => Some(type_tag.to_string()),
        Operation::SetField { value, .. } => Some(value.to_string()),
        Operation::CollectionAdd { item, .. } | Operation::CollectionRemove { item, .. } => {
            Some(item.to_string())
        }
        Operation::RemoveEntity { .. } | Operation::CollectionClear { .. } => None,
    }
}

fn render_text(dump: &LogDump) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Operation Log v{} (cycle {})\n",
        dump.format_version, dump.cycle_id
    ));
    out.push_str("================\n\n");

    out.push_str(&format!("Base versions ({})\n", dump.base_versions.len()));
    for base in &dump.base_versions {
        out.push_str(&format!("  {} @ {}\n", base.key, base.version));
    }
    out.push('\n');

    out.push_str(&format!(
        "Records ({} of {})\n",
        dump.records.len(),
        dump.operation_count
    ));
    for record in &dump.records {
        out.push_str(&format!(
            "[{:04}] @{:06} {:8} {}",
            record.index, record.offset, record.kind, record.key
        ));
        if let Some(field) = record.field {
            out.push_str(&format!(".f{field}"));
        }
        if let Some(ref detail) = record.detail {
            out.push_str(&format!(" {detail}"));
        }
        out.push_str(&format!(" ({} bytes)\n", record.body_len));
    }
    out
}
