//! Teardown for PTY children spawned by the terminal multiplexer.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::Child;
use tracing::{info, warn};

const GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Terminate a PTY child: signal its process group, wait up to the grace
/// period, then SIGKILL. Safe to call on an already-exited child.
pub async fn terminate_gracefully(child: &mut Box<dyn Child + Send>, name: &str, signal: Signal) {
    let Some(pid) = child.process_id() else {
        return;
    };
    let pid = i32::try_from(pid).unwrap_or(i32::MAX);

    info!("sending {signal:?} to {name} (pgid {pid})");
    // Negative PID addresses the process group.
    if let Err(e) = kill(Pid::from_raw(-pid), signal) {
        if e != nix::errno::Errno::ESRCH {
            warn!("failed to signal {name}: {e}");
        }
    }

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(None) => {}
            _ => return,
        }
        if start.elapsed() > GRACE {
            warn!("{name} did not exit, sending SIGKILL");
            if let Err(e) = kill(Pid::from_raw(-pid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("failed to kill {name}: {e}");
                }
            }
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
