//! Kernel IP set manipulation.
//!
//! Whole sets are replaced atomically: a scratch set named `<set>$` is
//! populated through an `ipset restore` batch on a pipe, swapped with the
//! live set, and destroyed. The kernel caps set names at 32 bytes, which is
//! why user-visible names stop at 30.

use std::{
    io,
    net::Ipv4Addr,
    process::{ExitStatus, Stdio},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Appended to a set name to form its scratch twin.
pub const SCRATCH_SUFFIX: char = '$';

const HASH_TYPE: &str = "hash:ip";

/// Errors that can occur while driving the set backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The helper binary could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// I/O towards the helper failed mid-flight.
    #[error("I/O error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The helper ran but reported failure.
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: ExitStatus },
}

/// Atomic whole-set replacement against the kernel.
#[async_trait]
pub trait SetBackend: Send + Sync {
    /// Replaces the contents of `set` with `ips` in one atomic step.
    /// Duplicate addresses are deduplicated by the kernel.
    async fn replace(&self, set: &str, ips: &[Ipv4Addr]) -> Result<(), BackendError>;
}

/// Backend driving the privileged `ipset(8)` helper.
#[derive(Debug, Clone)]
pub struct IpsetCli {
    program: String,
}

impl IpsetCli {
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("ipset")
    }

    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The batch fed to `ipset -exist restore`: create both sets (idempotent,
    /// and `swap` requires the live one to exist), then fill the scratch set.
    fn restore_script(set: &str, scratch: &str, ips: &[Ipv4Addr]) -> String {
        let mut script = String::new();
        script.push_str(&format!("create {set} {HASH_TYPE}\n"));
        script.push_str(&format!("create {scratch} {HASH_TYPE}\n"));
        script.push_str(&format!("flush {scratch}\n"));
        for ip in ips {
            script.push_str(&format!("add {scratch} {ip}\n"));
        }
        script
    }

    async fn restore(&self, script: &str) -> Result<(), BackendError> {
        let mut child = Command::new(&self.program)
            .args(["-exist", "restore"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|source| BackendError::Io {
                    program: self.program.clone(),
                    source,
                })?;
        }

        let status = child.wait().await.map_err(|source| BackendError::Io {
            program: self.program.clone(),
            source,
        })?;

        Self::check(format!("{} -exist restore", self.program), status)
    }

    async fn command(&self, args: &[&str]) -> Result<(), BackendError> {
        let status = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| BackendError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Self::check(format!("{} {}", self.program, args.join(" ")), status)
    }

    fn check(command: String, status: ExitStatus) -> Result<(), BackendError> {
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::CommandFailed { command, status })
        }
    }
}

impl Default for IpsetCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SetBackend for IpsetCli {
    async fn replace(&self, set: &str, ips: &[Ipv4Addr]) -> Result<(), BackendError> {
        let scratch = format!("{set}{SCRATCH_SUFFIX}");
        debug!("replacing set {set} ({} addresses)", ips.len());

        self.restore(&Self::restore_script(set, &scratch, ips)).await?;
        self.command(&["swap", &scratch, set]).await?;
        self.command(&["destroy", &scratch]).await?;

        Ok(())
    }
}

/// Recording backend for tests.
#[derive(Debug, Default)]
pub struct MockBackend {
    replaces: Mutex<Vec<(String, Vec<Ipv4Addr>)>>,
    failing: AtomicBool,
}

impl MockBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `replace` fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every committed replacement, in order.
    pub fn replaces(&self) -> Vec<(String, Vec<Ipv4Addr>)> {
        self.replaces.lock().expect("mock backend lock poisoned").clone()
    }

    /// Number of committed replacements.
    pub fn replace_count(&self) -> usize {
        self.replaces.lock().expect("mock backend lock poisoned").len()
    }

    /// The last committed contents of `set`, if it was ever replaced.
    pub fn live(&self, set: &str) -> Option<Vec<Ipv4Addr>> {
        self.replaces
            .lock()
            .expect("mock backend lock poisoned")
            .iter()
            .rev()
            .find(|(name, _)| name == set)
            .map(|(_, ips)| ips.clone())
    }
}

#[async_trait]
impl SetBackend for MockBackend {
    async fn replace(&self, set: &str, ips: &[Ipv4Addr]) -> Result<(), BackendError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Spawn {
                program: "mock".to_string(),
                source: io::Error::other("scripted backend failure"),
            });
        }

        self.replaces
            .lock()
            .expect("mock backend lock poisoned")
            .push((set.to_string(), ips.to_vec()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn restore_script_creates_both_sets_and_fills_scratch() {
        let script =
            IpsetCli::restore_script("blocked", "blocked$", &[ip("1.2.3.4"), ip("5.6.7.8")]);

        assert_eq!(
            script,
            "create blocked hash:ip\n\
             create blocked$ hash:ip\n\
             flush blocked$\n\
             add blocked$ 1.2.3.4\n\
             add blocked$ 5.6.7.8\n"
        );
    }

    #[test]
    fn restore_script_for_empty_set_has_no_adds() {
        let script = IpsetCli::restore_script("empty", "empty$", &[]);
        assert!(!script.contains("add "));
        assert!(script.contains("flush empty$\n"));
    }

    #[tokio::test]
    async fn mock_records_replacements_in_order() {
        let backend = MockBackend::new();
        backend.replace("a", &[ip("1.1.1.1")]).await.unwrap();
        backend.replace("b", &[ip("2.2.2.2")]).await.unwrap();
        backend.replace("a", &[ip("3.3.3.3")]).await.unwrap();

        assert_eq!(backend.replace_count(), 3);
        assert_eq!(backend.live("a"), Some(vec![ip("3.3.3.3")]));
        assert_eq!(backend.live("b"), Some(vec![ip("2.2.2.2")]));
        assert_eq!(backend.live("c"), None);
    }

    #[tokio::test]
    async fn mock_failure_commits_nothing() {
        let backend = MockBackend::new();
        backend.set_failing(true);

        assert!(backend.replace("a", &[ip("1.1.1.1")]).await.is_err());
        assert_eq!(backend.replace_count(), 0);

        backend.set_failing(false);
        assert!(backend.replace("a", &[ip("1.1.1.1")]).await.is_ok());
        assert_eq!(backend.live("a"), Some(vec![ip("1.1.1.1")]));
    }
}
