//! Header sent ahead of every send stream.
//!
//! `zfs send` does not carry user properties reliably across pools, so the
//! sender prefixes the stream with the ordered snapshot list and its
//! metadata. Framing is a fixed marker line followed by one line of base64
//! encoded JSON; everything after the second newline is the raw stream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use snapmesh_zfs::Snapshot;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ReplError;

/// First line of every framed stream.
pub const PRELUDE_MARKER: &[u8] = b"#SNAPMESH-PRELUDE#\n";

const MAX_PRELUDE_LINE: usize = 64 * 1024 * 1024;

/// Snapshot metadata travelling with a stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prelude {
    /// Snapshots of the sending filesystem, oldest first.
    pub snapshot_properties: Vec<Snapshot>,
}

impl Prelude {
    /// Builds a prelude.
    pub fn new(snapshot_properties: Vec<Snapshot>) -> Self {
        Self {
            snapshot_properties,
        }
    }

    /// Framed bytes to write before the stream.
    pub fn encode(&self) -> Result<Vec<u8>, ReplError> {
        let json = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(PRELUDE_MARKER.len() + json.len() * 4 / 3 + 8);
        out.extend_from_slice(PRELUDE_MARKER);
        out.extend_from_slice(STANDARD.encode(json).as_bytes());
        out.push(b'\n');
        Ok(out)
    }

    /// Consumes the prelude from `reader`, leaving it positioned at the first
    /// stream byte.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ReplError>
    where
        R: AsyncBufRead + Unpin,
    {
        Self::read_bounded(reader, MAX_PRELUDE_LINE).await
    }

    /// [`Prelude::read_from`] with a cap on the encoded payload line.
    ///
    /// Never buffers more than `max_line + 1` bytes of it.
    pub async fn read_bounded<R>(reader: &mut R, max_line: usize) -> Result<Self, ReplError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut marker = Vec::with_capacity(PRELUDE_MARKER.len());
        (&mut *reader)
            .take(PRELUDE_MARKER.len() as u64)
            .read_until(b'\n', &mut marker)
            .await?;
        if marker != PRELUDE_MARKER {
            return Err(ReplError::Prelude {
                msg: "missing start marker".to_string(),
            });
        }

        let mut line = Vec::new();
        (&mut *reader)
            .take(max_line as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if line.last() != Some(&b'\n') {
            let msg = if line.len() > max_line {
                format!("prelude exceeds {max_line} bytes")
            } else {
                "truncated prelude".to_string()
            };
            return Err(ReplError::Prelude { msg });
        }
        line.pop();
        let json = STANDARD.decode(&line).map_err(|e| ReplError::Prelude {
            msg: format!("bad base64: {e}"),
        })?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_prelude_leaves_stream_bytes() {
        let prelude = Prelude::new(vec![
            Snapshot::new("s1").with_meta("message", "line one\nline two"),
            Snapshot::new("s2"),
        ]);
        let mut framed = prelude.encode().unwrap();
        framed.extend_from_slice(b"\x00\x01stream-bytes");

        let mut reader = BufReader::new(&framed[..]);
        let decoded = Prelude::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, prelude);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x01stream-bytes");
    }

    #[tokio::test]
    async fn test_missing_marker_is_rejected() {
        let mut reader = BufReader::new(&b"raw zfs stream"[..]);
        assert!(matches!(
            Prelude::read_from(&mut reader).await,
            Err(ReplError::Prelude { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_prelude_is_rejected() {
        let mut framed = PRELUDE_MARKER.to_vec();
        framed.extend_from_slice(b"eyJzbmFw");
        let mut reader = BufReader::new(&framed[..]);
        assert!(matches!(
            Prelude::read_from(&mut reader).await,
            Err(ReplError::Prelude { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_prelude_stops_at_the_cap() {
        let mut framed = PRELUDE_MARKER.to_vec();
        framed.extend(std::iter::repeat(b'A').take(64 * 1024));
        let mut reader = BufReader::new(&framed[..]);
        match Prelude::read_bounded(&mut reader, 1024).await {
            Err(ReplError::Prelude { msg }) => assert!(msg.contains("exceeds"), "{msg}"),
            other => panic!("unexpected result {other:?}"),
        }
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 64 * 1024 - 1025);
    }

    #[tokio::test]
    async fn test_long_first_line_is_not_buffered() {
        let framed = vec![b'x'; 1 << 20];
        let mut reader = BufReader::new(&framed[..]);
        assert!(matches!(
            Prelude::read_from(&mut reader).await,
            Err(ReplError::Prelude { .. })
        ));
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), (1 << 20) - PRELUDE_MARKER.len());
    }

    fn snapshot() -> impl Strategy<Value = Snapshot> {
        (
            "[a-z0-9-]{1,12}",
            prop::collection::btree_map("[a-z]{1,8}", any::<String>(), 0..4),
        )
            .prop_map(|(id, metadata)| Snapshot { id, metadata })
    }

    proptest! {
        #[test]
        fn prop_prelude_preserves_order_and_metadata(
            snapshots in prop::collection::vec(snapshot(), 0..8),
        ) {
            let prelude = Prelude::new(snapshots);
            let framed = prelude.encode().unwrap();
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt
                .block_on(async { Prelude::read_from(&mut BufReader::new(&framed[..])).await })
                .unwrap();
            prop_assert_eq!(decoded, prelude);
        }
    }
}
