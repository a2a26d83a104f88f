//! `testSummary.json` parsing.
//!
//! Test commands may drop a summary file in the output directory naming
//! each sub-test's outcome and any log files to publish. Two shapes are
//! accepted per entry: a bare boolean, or `{"success": ..., "logs": [...]}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const SUMMARY_FILENAME: &str = "testSummary.json";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Flag(bool),
    Detailed {
        success: bool,
        #[serde(default)]
        logs: Vec<String>,
    },
}

/// One sub-test's parsed outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTestResult {
    pub success: bool,
    /// Log paths, resolved relative to the output directory.
    pub logs: Vec<PathBuf>,
}

/// Parse a summary file's text. Relative log paths resolve against
/// `output_dir`; absolute paths are kept (commands see container paths,
/// which equal host paths only on bare machines, so prefer relative).
pub fn parse_summary(
    text: &str,
    output_dir: &Path,
) -> Result<BTreeMap<String, SubTestResult>> {
    let raw: BTreeMap<String, RawEntry> =
        serde_json::from_str(text).context("parsing testSummary.json")?;

    let mut out = BTreeMap::new();
    for (name, entry) in raw {
        let result = match entry {
            RawEntry::Flag(success) => SubTestResult {
                success,
                logs: vec![],
            },
            RawEntry::Detailed { success, logs } => SubTestResult {
                success,
                logs: logs
                    .into_iter()
                    .map(|l| {
                        let path = PathBuf::from(&l);
                        if path.is_absolute() {
                            path
                        } else {
                            output_dir.join(path)
                        }
                    })
                    .collect(),
            },
        };
        out.insert(name, result);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_entry_shapes() {
        let text = r#"{
            "test_a": true,
            "test_b": false,
            "test_c": {"success": false, "logs": ["c.log", "/abs/c2.log"]}
        }"#;
        let parsed = parse_summary(text, Path::new("/out")).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(parsed["test_a"].success);
        assert!(!parsed["test_b"].success);
        let c = &parsed["test_c"];
        assert!(!c.success);
        assert_eq!(c.logs[0], Path::new("/out/c.log"));
        assert_eq!(c.logs[1], Path::new("/abs/c2.log"));
    }

    #[test]
    fn rejects_malformed_summary() {
        assert!(parse_summary("not json", Path::new("/out")).is_err());
        assert!(parse_summary(r#"{"t": "yes"}"#, Path::new("/out")).is_err());
    }
}
