use crate::context::{ContextSnapshot, SNAPSHOT_VERSION};
use std::io;
use std::path::{Path, PathBuf};

/// Stable-storage log of in-flight round state.
///
/// Every state-advancing transition that must survive a crash (a stored
/// prepare request, a preparation quorum, a sent commit) is written here
/// before the corresponding message leaves the node. The write is atomic:
/// temp file, fsync, rename.
#[derive(Debug)]
pub struct RecoveryLog {
    path: PathBuf,
    enabled: bool,
}

impl RecoveryLog {
    /// When `ignore_recovery_logs` is set, both `save` and `load` become
    /// no-ops.
    pub fn new(path: impl Into<PathBuf>, ignore_recovery_logs: bool) -> Self {
        Self {
            path: path.into(),
            enabled: !ignore_recovery_logs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Atomically persists the snapshot. A crash mid-write leaves the prior
    /// snapshot intact; the fsync before rename keeps the rename from
    /// landing a zero-length file.
    pub fn save(&self, snapshot: &ContextSnapshot) -> io::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let json = serde_json::to_string(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Restores the last persisted snapshot.
    ///
    /// Returns `Ok(None)` when the log is disabled or no snapshot exists;
    /// `Err` when a snapshot exists but cannot be parsed.
    pub fn load(&self) -> io::Result<Option<ContextSnapshot>> {
        if !self.enabled {
            return Ok(None);
        }
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let snapshot: ContextSnapshot = serde_json::from_str(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if snapshot.version > SNAPSHOT_VERSION {
            tracing::warn!(
                snapshot_version = snapshot.version,
                supported_version = SNAPSHOT_VERSION,
                "recovery snapshot has a newer version than supported; loading anyway"
            );
        }
        if let Err(reason) = snapshot.validate() {
            tracing::warn!(%reason, "recovery snapshot failed validation; ignoring it");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConsensusContext;
    use crate::validator::ValidatorSet;
    use alloy_primitives::B256;
    use dbft_primitives::ProposalSlot;
    use ed25519_dalek::SigningKey;

    fn signing_key(index: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[0] = index;
        bytes[31] = 0xED;
        SigningKey::from_bytes(&bytes)
    }

    fn snapshot_with_commit() -> ContextSnapshot {
        let set = ValidatorSet::new((0..4).map(|i| signing_key(i).verifying_key()).collect());
        let mut ctx = ConsensusContext::new(set, Some(signing_key(2)));
        ctx.start_height(10, B256::repeat_byte(0x10), 1_000);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        ctx.make_commit(ProposalSlot::Priority).unwrap();
        ctx.snapshot()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("dbft-recovery-{name}-{}", std::process::id()))
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = temp_path("roundtrip");
        let _ = std::fs::remove_dir_all(&dir);
        let log = RecoveryLog::new(dir.join("consensus.json"), false);

        let snapshot = snapshot_with_commit();
        log.save(&snapshot).expect("save should succeed");

        let loaded = log
            .load()
            .expect("load should succeed")
            .expect("snapshot should exist");
        assert_eq!(loaded.height, 10);
        assert!(loaded.commit_sent);
        assert_eq!(loaded.commits.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let log = RecoveryLog::new(temp_path("missing").join("none.json"), false);
        assert!(log.load().expect("missing file is not an error").is_none());
    }

    #[test]
    fn test_load_corrupt_is_an_error() {
        let dir = temp_path("corrupt");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("consensus.json");
        std::fs::write(&path, "not json {{{").unwrap();

        let log = RecoveryLog::new(&path, false);
        assert!(log.load().is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_disabled_log_is_a_noop() {
        let dir = temp_path("disabled");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("consensus.json");
        let log = RecoveryLog::new(&path, true);

        log.save(&snapshot_with_commit()).expect("save is a no-op");
        assert!(!path.exists(), "disabled log must not touch disk");
        assert!(log.load().unwrap().is_none());
    }

    #[test]
    fn test_latest_save_wins() {
        let dir = temp_path("latest");
        let _ = std::fs::remove_dir_all(&dir);
        let log = RecoveryLog::new(dir.join("consensus.json"), false);

        let mut snapshot = snapshot_with_commit();
        log.save(&snapshot).unwrap();
        snapshot.view = 3;
        for envelope in snapshot.commits.iter_mut().chain(&mut snapshot.change_views) {
            envelope.view = 3;
        }
        log.save(&snapshot).unwrap();

        let loaded = log.load().unwrap().expect("snapshot exists");
        assert_eq!(loaded.view, 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
