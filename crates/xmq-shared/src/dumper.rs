//! ---
//! xmq_section: "04-shared-state-replication"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Replicated shared hashes, queues, and their manager."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use xmq_common::CancellationToken;

use crate::manager::SharedObjectManager;
use crate::Result;

/// Write the manager dump to `path`, replacing it atomically.
pub fn dump_to_file(manager: &SharedObjectManager, path: &Path) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, manager.dump_shared_objects())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Thread rewriting the dump file on a fixed interval until stopped.
pub struct FileDumper {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl FileDumper {
    /// Start dumping `manager` to `path` every `interval`, first right away.
    pub fn spawn(
        manager: Arc<SharedObjectManager>,
        path: PathBuf,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let thread = thread::Builder::new()
            .name("xmq-dumper".into())
            .spawn(move || {
                info!(path = %path.display(), interval = ?interval, "dumper started");
                loop {
                    match dump_to_file(&manager, &path) {
                        Ok(()) => debug!(path = %path.display(), "shared objects dumped"),
                        Err(err) => warn!(path = %path.display(), error = %err, "dump failed"),
                    }
                    if worker_token.wait_for(interval) {
                        break;
                    }
                }
            })?;
        Ok(Self {
            token,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dumper thread panicked");
            }
        }
    }
}

impl Drop for FileDumper {
    fn drop(&mut self) {
        self.stop();
    }
}
