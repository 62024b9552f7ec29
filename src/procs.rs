//! Side-car subprocess manager.
//!
//! Runs the configured auxiliary commands (`procs.run`) with the templated
//! environment, tails their output into the log, and signals them on
//! shutdown: SIGTERM for a graceful stop, SIGKILL for a forceful one.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ProcsOpts;

pub struct Procs {
    commands: Vec<String>,
    env: HashMap<String, String>,
    pids: Mutex<Vec<i32>>,
    tracker: TaskTracker,
}

impl Procs {
    pub fn new(opts: &ProcsOpts) -> Self {
        Self {
            commands: opts.run.clone(),
            env: opts.env.clone(),
            pids: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn every configured command under `/bin/sh -c` with the templated
    /// environment as its entire environment.
    pub fn run(&self) {
        for raw in &self.commands {
            let mut command = Command::new("/bin/sh");
            command
                .arg("-c")
                .arg(raw)
                .env_clear()
                .envs(&self.env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(cmd = %raw, error = %e, "Failed to spawn command");
                    continue;
                }
            };
            if let Some(pid) = child.id() {
                self.pids.lock().unwrap().push(pid as i32);
            }

            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(tail(stdout, raw.clone(), "stdout"));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(tail(stderr, raw.clone(), "stderr"));
            }

            info!(cmd = %raw, "Running command");
            let raw = raw.clone();
            self.tracker.spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => {
                        info!(cmd = %raw, "Command exited")
                    }
                    Ok(status) => {
                        warn!(cmd = %raw, code = ?status.code(), "Command exited with error")
                    }
                    Err(e) => warn!(cmd = %raw, error = %e, "Failed waiting for command"),
                }
            });
        }
        self.tracker.close();
    }

    /// SIGTERM every child and wait for them to exit.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.signal(libc::SIGTERM);
        self.tracker.wait().await;
    }

    /// SIGKILL every child without waiting.
    pub fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, signal: i32) {
        for pid in self.pids.lock().unwrap().iter() {
            unsafe {
                libc::kill(*pid, signal);
            }
        }
    }
}

async fn tail(reader: impl AsyncRead + Unpin, cmd: String, channel: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if channel == "stderr" {
            warn!(cmd = %cmd, output = channel, "{line}");
        } else {
            info!(cmd = %cmd, output = channel, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts(run: &[&str], env: &[(&str, &str)]) -> ProcsOpts {
        ProcsOpts {
            run: run.iter().map(|s| s.to_string()).collect(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_short_command_runs_to_completion() {
        let procs = Procs::new(&opts(&["true"], &[]));
        procs.run();
        procs.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_long_running_command() {
        // `wait` makes the shell responsive to SIGTERM while sleeping.
        let procs = Procs::new(&opts(
            &["trap 'kill $! 2>/dev/null; exit 0' TERM; sleep 60 & wait $!"],
            &[("PATH", "/usr/bin:/bin")],
        ));
        procs.run();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), procs.shutdown())
            .await
            .expect("shutdown should not outlive the grace window");
    }

    #[tokio::test]
    async fn test_kill_terminates_immediately() {
        let procs = Procs::new(&opts(&["sleep 60"], &[("PATH", "/usr/bin:/bin")]));
        procs.run();
        tokio::time::sleep(Duration::from_millis(50)).await;

        procs.kill();
        tokio::time::timeout(Duration::from_secs(5), procs.tracker.wait())
            .await
            .expect("killed children should be reaped promptly");
    }

    #[tokio::test]
    async fn test_children_see_only_the_configured_environment() {
        std::env::set_var("PROCS_TEST_LEAK", "should-not-appear");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cmd = format!("echo \"$GIVEN:$PROCS_TEST_LEAK\" > {}", out.path().display());

        let procs = Procs::new(&opts(&[&cmd], &[("GIVEN", "yes")]));
        procs.run();
        tokio::time::timeout(Duration::from_secs(5), procs.shutdown())
            .await
            .unwrap();

        let written = std::fs::read_to_string(out.path()).unwrap();
        assert_eq!(written.trim_end(), "yes:");
    }

    #[tokio::test]
    async fn test_shutdown_without_run_returns() {
        let procs = Procs::new(&opts(&[], &[]));
        tokio::time::timeout(Duration::from_secs(1), procs.shutdown())
            .await
            .expect("no children to wait for");
    }
}
