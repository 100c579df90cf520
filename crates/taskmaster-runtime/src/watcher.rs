// SPDX-License-Identifier: Apache-2.0

//! Config file watcher: the mtime-polling half of C2. Runs on its own
//! thread and posts a fire-and-forget reload request whenever the file's
//! modification time changes. Polling at ~1 Hz naturally debounces: two
//! on-disk changes inside one tick are observed as a single mtime delta.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::engine::EngineHandle;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the mtime-watch thread. Runs until the engine's command channel
/// is torn down (i.e. the supervisor is shutting down), at which point the
/// fire-and-forget sends start failing and the thread exits.
pub fn spawn(path: PathBuf, handle: EngineHandle) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("taskmaster-config-watch".to_string())
        .spawn(move || run(path, handle))
        .expect("failed to spawn config watcher thread")
}

fn run(path: PathBuf, handle: EngineHandle) {
    let mut last_mtime = mtime(&path);
    loop {
        std::thread::sleep(POLL_INTERVAL);
        let current = mtime(&path);
        if current.is_some() && current != last_mtime {
            last_mtime = current;
            if !handle.reload_async() {
                return;
            }
        } else if current.is_none() {
            warn!(path = %path.display(), "failed to stat config file while watching");
        }
    }
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
