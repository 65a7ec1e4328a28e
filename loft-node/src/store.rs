//! Directory-backed snapshot store: payload source for serving, install sink for fetching.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use loft_core::{InstallSink, PayloadSource, ProgressEvent, ProgressSink, Status};
use tracing::{debug, info, warn};

pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot names are single path components.
    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.starts_with('.')
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid snapshot name {:?}", name),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl PayloadSource for DirStore {
    fn gather(&self, key: &str) -> io::Result<Vec<u8>> {
        let path = self.path_for(key)?;
        let bytes = fs::read(&path)?;
        debug!(path = %path.display(), bytes = bytes.len(), "snapshot read");
        Ok(bytes)
    }
}

impl InstallSink for DirStore {
    /// Write to a hidden partial file, sync, then rename over the target.
    fn install(&self, logical_name: &str, bytes: Vec<u8>) -> io::Result<()> {
        let target = self.path_for(logical_name)?;
        fs::create_dir_all(&self.root)?;
        let partial = self.root.join(format!(".{}.partial", logical_name));
        let written = File::create(&partial).and_then(|mut f| {
            f.write_all(&bytes)?;
            f.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, &target)?;
        info!(path = %target.display(), bytes = bytes.len(), "snapshot installed");
        Ok(())
    }
}

/// Progress to the log.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Progress {
                transfer_id,
                peer,
                direction,
                bytes,
                total,
                eta_secs,
            } => {
                let percent = if total == 0 {
                    100.0
                } else {
                    bytes as f64 * 100.0 / total as f64
                };
                info!(
                    transfer = %transfer_id,
                    peer = %peer,
                    ?direction,
                    bytes,
                    total,
                    percent = (percent * 10.0).round() / 10.0,
                    eta_secs = ?eta_secs.map(|s| s.round() as u64),
                    "progress"
                );
            }
            ProgressEvent::StrategyChanged {
                transfer_id,
                peer,
                strategy,
            } => info!(transfer = %transfer_id, peer = %peer, ?strategy, "strategy"),
            ProgressEvent::Finished {
                transfer_id,
                peer,
                status,
                error,
                ..
            } => match (status, error) {
                (Status::Completed, _) => info!(transfer = %transfer_id, peer = %peer, "finished"),
                (status, Some(e)) => {
                    warn!(transfer = %transfer_id, peer = %peer, ?status, error = %e, "finished")
                }
                (status, None) => info!(transfer = %transfer_id, peer = %peer, ?status, "finished"),
            },
        }
    }
}
