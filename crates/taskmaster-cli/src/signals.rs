// SPDX-License-Identifier: Apache-2.0

//! OS signal handling (C7). Handlers never touch engine state directly —
//! they only post onto the engine's command queue, satisfying the
//! same non-reentrancy rule the engine itself relies on internally.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use taskmaster_runtime::EngineHandle;

/// Spawns a background thread that blocks on the process's signal mask and
/// forwards SIGHUP to a reload, SIGINT/SIGTERM to an orderly shutdown.
pub fn install(handle: EngineHandle) {
    let mut signals = match Signals::new([SIGHUP, SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers");
            return;
        }
    };

    std::thread::Builder::new()
        .name("taskmaster-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGHUP => {
                        tracing::info!("SIGHUP received, reloading configuration");
                        if !handle.reload_async() {
                            break;
                        }
                    }
                    SIGINT | SIGTERM => {
                        tracing::info!("shutdown signal received");
                        handle.shutdown();
                        std::process::exit(0);
                    }
                    _ => {}
                }
            }
        })
        .expect("failed to spawn signal thread");
}
