//! Warm on-disk cache tier.
//!
//! Files are named by content fingerprint and survive process restarts. The
//! record format is self-describing so operators can safely delete the whole
//! directory: magic, version tag, length-prefixed payload, trailing checksum.
//! Anything that fails to parse or verify is treated as absent and pruned
//! best-effort.

use std::path::PathBuf;

use tracing::debug;

use crate::fingerprint::Fingerprint;

const MAGIC: [u8; 4] = *b"KBWC";
const VERSION: u16 = 1;
/// magic + version + payload length.
const HEADER_LEN: usize = 4 + 2 + 8;
const CHECKSUM_LEN: usize = 4;

pub(crate) struct WarmTier {
    dir: PathBuf,
}

impl WarmTier {
    pub(crate) fn new(dir: PathBuf) -> Self {
        if let Err(error) = std::fs::create_dir_all(&dir) {
            debug!(?error, dir = %dir.display(), "warm cache dir unavailable");
        }
        Self { dir }
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.to_hex())
    }

    /// Returns the payload for `fingerprint`, or `None` for missing, corrupt,
    /// or version-mismatched entries. Bad entries are removed best-effort.
    pub(crate) async fn get(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let path = self.entry_path(fingerprint);
        let raw = tokio::fs::read(&path).await.ok()?;
        match decode(&raw) {
            Some(payload) => Some(payload),
            None => {
                debug!(path = %path.display(), "pruning corrupt warm cache entry");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    /// Write-through persist. Failures are logged and swallowed; the warm
    /// tier is an optimization, never a correctness dependency.
    pub(crate) async fn put(&self, fingerprint: &Fingerprint, payload: &[u8]) {
        let path = self.entry_path(fingerprint);
        let tmp = path.with_extension("tmp");
        let encoded = encode(payload);
        if let Err(error) = tokio::fs::write(&tmp, &encoded).await {
            debug!(?error, path = %tmp.display(), "warm cache write failed");
            return;
        }
        if let Err(error) = tokio::fs::rename(&tmp, &path).await {
            debug!(?error, path = %path.display(), "warm cache rename failed");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&checksum(payload));
    out
}

fn decode(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < HEADER_LEN + CHECKSUM_LEN {
        return None;
    }
    if raw[..4] != MAGIC {
        return None;
    }
    let version = u16::from_le_bytes([raw[4], raw[5]]);
    if version != VERSION {
        return None;
    }
    let len = u64::from_le_bytes(raw[6..14].try_into().ok()?) as usize;
    let expected_total = HEADER_LEN.checked_add(len)?.checked_add(CHECKSUM_LEN)?;
    if raw.len() != expected_total {
        return None;
    }
    let payload = &raw[HEADER_LEN..HEADER_LEN + len];
    if raw[HEADER_LEN + len..] != checksum(payload) {
        return None;
    }
    Some(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"# core principles\nkeep it small\n";
        assert_eq!(decode(&encode(payload)).as_deref(), Some(&payload[..]));
        assert_eq!(decode(&encode(b"")).as_deref(), Some(&b""[..]));
    }

    #[test]
    fn decode_rejects_corruption() {
        let mut raw = encode(b"payload");
        raw[HEADER_LEN] ^= 0xff;
        assert_eq!(decode(&raw), None);

        let mut truncated = encode(b"payload");
        truncated.pop();
        assert_eq!(decode(&truncated), None);

        let mut bad_magic = encode(b"payload");
        bad_magic[0] = b'X';
        assert_eq!(decode(&bad_magic), None);

        let mut bad_version = encode(b"payload");
        bad_version[4] = 0xff;
        assert_eq!(decode(&bad_version), None);

        assert_eq!(decode(b"short"), None);
    }

    #[tokio::test]
    async fn tier_round_trips_and_prunes_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = WarmTier::new(dir.path().to_path_buf());
        let fingerprint = Fingerprint::of(b"aaa");

        assert_eq!(tier.get(&fingerprint).await, None);
        tier.put(&fingerprint, b"aaa").await;
        assert_eq!(tier.get(&fingerprint).await.as_deref(), Some(&b"aaa"[..]));

        // Scribble over the stored entry; the next read prunes it.
        let path = dir.path().join(fingerprint.to_hex());
        tokio::fs::write(&path, b"garbage").await.expect("write");
        assert_eq!(tier.get(&fingerprint).await, None);
        assert!(!path.exists());
    }
}
