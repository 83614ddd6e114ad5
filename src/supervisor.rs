//! Daemon supervisor.
//!
//! Wraps the daemon as a child process and restarts it on unexpected exit
//! with exponential backoff. A child that keeps dying within five seconds
//! of spawning backs the delay off up to one minute; a child that survived
//! five seconds resets the counter. Signals pass through: SIGTERM/SIGINT
//! stop the daemon gracefully, SIGUSR1 asks it to purge every hosted tmux
//! session on the way out.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::Paths;

/// A child that lived at least this long is considered healthy.
const HEALTHY_RUNTIME: Duration = Duration::from_secs(5);

/// Backoff base and ceiling.
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;

/// Restart delay after `quick_deaths` consecutive quick exits.
pub fn backoff_delay(quick_deaths: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << quick_deaths.min(16));
    Duration::from_millis(exp.min(BACKOFF_CAP_MS))
}

/// Run the supervisor loop. Returns when the daemon has exited after a
/// stop signal.
pub async fn run(paths: &Paths, port: u16) -> Result<()> {
    paths.ensure()?;
    let pid_file = paths.pid_file();
    std::fs::write(&pid_file, std::process::id().to_string())
        .with_context(|| format!("writing {}", pid_file.display()))?;

    let exe = std::env::current_exe().context("resolving own executable")?;
    let log_file = paths.log_file();

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;

    let mut quick_deaths: u32 = 0;

    loop {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("opening {}", log_file.display()))?;
        let log_err = log.try_clone().context("cloning log handle")?;

        let port_arg = port.to_string();
        let mut child = Command::new(&exe)
            .args(["daemon", "-p", port_arg.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .context("spawning daemon")?;
        let child_pid = child.id();
        let started = Instant::now();
        info!("daemon started (pid {:?})", child_pid);

        tokio::select! {
            status = child.wait() => {
                let status = status.context("waiting on daemon")?;
                if started.elapsed() >= HEALTHY_RUNTIME {
                    quick_deaths = 0;
                } else {
                    quick_deaths += 1;
                }
                let delay = backoff_delay(quick_deaths);
                warn!(
                    "daemon exited unexpectedly ({status}); restarting in {delay:?} \
                     ({quick_deaths} quick deaths)"
                );
                tokio::time::sleep(delay).await;
            }
            _ = term.recv() => {
                info!("stopping daemon");
                forward_signal(child_pid, libc::SIGTERM);
                let _ = child.wait().await;
                break;
            }
            _ = int.recv() => {
                info!("stopping daemon");
                forward_signal(child_pid, libc::SIGTERM);
                let _ = child.wait().await;
                break;
            }
            _ = usr1.recv() => {
                info!("stopping daemon and killing all sessions");
                forward_signal(child_pid, libc::SIGUSR1);
                let _ = child.wait().await;
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

fn forward_signal(pid: Option<u32>, sig: i32) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, sig);
        }
    }
}

/// Read the supervisor pid from its pid file, if the process is alive.
pub fn running_pid(paths: &Paths) -> Option<u32> {
    let pid: u32 = std::fs::read_to_string(paths.pid_file())
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if process_alive(pid) {
        Some(pid)
    } else {
        // Stale pid files make every status check lie; drop them here.
        let _ = std::fs::remove_file(paths.pid_file());
        None
    }
}

pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(32_000));
    }

    #[test]
    fn backoff_caps_at_one_minute() {
        assert_eq!(backoff_delay(6), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(30), Duration::from_millis(60_000));
    }

    #[test]
    fn five_quick_deaths_push_the_delay_past_half_a_minute() {
        // Five consecutive sub-5 s exits mean the sixth restart waits 32 s.
        assert!(backoff_delay(5) >= Duration::from_secs(32));
    }
}
