//! Send ranges: what a replication stream covers and how `zfs send` is invoked for it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ZfsError;
use crate::layout::DatasetLayout;
use crate::types::Origin;

/// Wire sentinel for a full send.
pub const START: &str = "START";

/// Base of a send stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FromSnapshot {
    /// Full stream from the beginning of the filesystem.
    Start,
    /// Incremental stream from a snapshot of the same filesystem.
    Snapshot(String),
    /// Incremental stream from the snapshot a clone was taken from.
    CloneOrigin(Origin),
}

impl FromSnapshot {
    /// Parses the wire form: `START`, `{snapshot}` or `{filesystem}@{snapshot}`.
    pub fn parse(raw: &str) -> Self {
        if raw == START || raw.is_empty() {
            return FromSnapshot::Start;
        }
        match raw.split_once('@') {
            Some((filesystem_id, snapshot_id)) => {
                FromSnapshot::CloneOrigin(Origin::new(filesystem_id, snapshot_id))
            }
            None => FromSnapshot::Snapshot(raw.to_string()),
        }
    }

    /// Base for a segment: the last common snapshot if there is one, otherwise
    /// the clone origin, otherwise the beginning.
    pub fn for_segment(common: Option<&str>, origin: Option<&Origin>) -> Self {
        match (common, origin) {
            (Some(snapshot_id), _) => FromSnapshot::Snapshot(snapshot_id.to_string()),
            (None, Some(origin)) => FromSnapshot::CloneOrigin(origin.clone()),
            (None, None) => FromSnapshot::Start,
        }
    }
}

impl fmt::Display for FromSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FromSnapshot::Start => f.write_str(START),
            FromSnapshot::Snapshot(id) => f.write_str(id),
            FromSnapshot::CloneOrigin(origin) => write!(f, "{origin}"),
        }
    }
}

impl From<String> for FromSnapshot {
    fn from(raw: String) -> Self {
        FromSnapshot::parse(&raw)
    }
}

impl From<FromSnapshot> for String {
    fn from(from: FromSnapshot) -> Self {
        from.to_string()
    }
}

/// One replication stream: `filesystem_id` from `from` up to `to_snapshot`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRange {
    /// Filesystem being sent.
    pub filesystem_id: String,
    /// Base of the stream.
    pub from: FromSnapshot,
    /// Last snapshot included.
    pub to_snapshot: String,
}

impl SendRange {
    /// Builds a range.
    pub fn new(
        filesystem_id: impl Into<String>,
        from: FromSnapshot,
        to_snapshot: impl Into<String>,
    ) -> Self {
        Self {
            filesystem_id: filesystem_id.into(),
            from,
            to_snapshot: to_snapshot.into(),
        }
    }

    /// Arguments following `zfs send`.
    ///
    /// Full sends use `-R` so intermediate snapshots travel too; clone bases
    /// must be fully qualified.
    pub fn send_args(&self, layout: &DatasetLayout) -> Vec<String> {
        let target = layout.snapshot(&self.filesystem_id, &self.to_snapshot);
        match &self.from {
            FromSnapshot::Start => vec!["-p".into(), "-R".into(), target],
            FromSnapshot::Snapshot(id) => vec!["-p".into(), "-I".into(), id.clone(), target],
            FromSnapshot::CloneOrigin(origin) => vec![
                "-p".into(),
                "-I".into(),
                layout.snapshot(&origin.filesystem_id, &origin.snapshot_id),
                target,
            ],
        }
    }

    /// Full argument list for a dry-run size estimate.
    pub fn predict_args(&self, layout: &DatasetLayout) -> Vec<String> {
        let mut args = vec!["send".to_string(), "-nP".to_string()];
        args.extend(self.send_args(layout));
        args
    }
}

/// Extracts the stream size from `zfs send -nP` output.
///
/// The last line reads `size\t<bytes>`:
///
/// ```text
/// incremental     now     pool/foo@now2   105044936
/// size    105044936
/// ```
pub fn parse_predicted_size(output: &str) -> Result<u64, ZfsError> {
    let parse_err = || ZfsError::Parse {
        command: "zfs send -nP".to_string(),
        output: output.to_string(),
    };
    let line = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .last()
        .ok_or_else(parse_err)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(parse_err());
    }
    fields[1].parse::<u64>().map_err(|_| parse_err())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_snapshot_wire_forms() {
        assert_eq!(FromSnapshot::parse("START"), FromSnapshot::Start);
        assert_eq!(
            FromSnapshot::parse("snap1"),
            FromSnapshot::Snapshot("snap1".into())
        );
        assert_eq!(
            FromSnapshot::parse("fs1@snap1"),
            FromSnapshot::CloneOrigin(Origin::new("fs1", "snap1"))
        );
        assert_eq!(FromSnapshot::parse("fs1@snap1").to_string(), "fs1@snap1");
        assert_eq!(FromSnapshot::Start.to_string(), "START");
    }

    #[test]
    fn test_from_snapshot_serde_is_a_string() {
        let json = serde_json::to_string(&FromSnapshot::CloneOrigin(Origin::new("a", "b"))).unwrap();
        assert_eq!(json, "\"a@b\"");
        let back: FromSnapshot = serde_json::from_str("\"START\"").unwrap();
        assert_eq!(back, FromSnapshot::Start);
    }

    #[test]
    fn test_for_segment_prefers_common_snapshot() {
        let origin = Origin::new("parent", "p1");
        assert_eq!(
            FromSnapshot::for_segment(Some("s1"), Some(&origin)),
            FromSnapshot::Snapshot("s1".into())
        );
        assert_eq!(
            FromSnapshot::for_segment(None, Some(&origin)),
            FromSnapshot::CloneOrigin(origin)
        );
        assert_eq!(FromSnapshot::for_segment(None, None), FromSnapshot::Start);
    }

    #[test]
    fn test_full_send_args() {
        let layout = DatasetLayout::default();
        let range = SendRange::new("fs1", FromSnapshot::Start, "s2");
        assert_eq!(range.send_args(&layout), vec!["-p", "-R", "pool/dmfs/fs1@s2"]);
    }

    #[test]
    fn test_incremental_send_args() {
        let layout = DatasetLayout::default();
        let range = SendRange::new("fs1", FromSnapshot::Snapshot("s1".into()), "s2");
        assert_eq!(
            range.send_args(&layout),
            vec!["-p", "-I", "s1", "pool/dmfs/fs1@s2"]
        );
    }

    #[test]
    fn test_clone_origin_send_args_are_fully_qualified() {
        let layout = DatasetLayout::default();
        let range = SendRange::new(
            "clone1",
            FromSnapshot::CloneOrigin(Origin::new("fs1", "s1")),
            "c1",
        );
        assert_eq!(
            range.predict_args(&layout),
            vec!["send", "-nP", "-p", "-I", "pool/dmfs/fs1@s1", "pool/dmfs/clone1@c1"]
        );
    }

    #[test]
    fn test_parse_predicted_size() {
        let full = "full\tpool/foo@now2\t105050056\nsize\t105050056\n";
        assert_eq!(parse_predicted_size(full).unwrap(), 105050056);
        let incremental = "incremental\tnow\tpool/foo@now2\t105044936\nsize\t105044936";
        assert_eq!(parse_predicted_size(incremental).unwrap(), 105044936);
    }

    #[test]
    fn test_parse_predicted_size_rejects_garbage() {
        assert!(parse_predicted_size("").is_err());
        assert!(parse_predicted_size("size\n").is_err());
        assert!(parse_predicted_size("size\tlots\n").is_err());
    }
}
