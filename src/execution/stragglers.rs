// src/execution/stragglers.rs

//! Waiting for OS processes that outlive their supervising task.
//!
//! Java services fork helpers that do not die with the parent, so shutdown
//! polls the process table until nothing matching a service remains.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, info};

/// Read-only view of the host process table
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTable: Send + Sync {
    /// Number of processes whose command line contains `pattern`
    fn count_matching(&self, pattern: &str) -> usize;

    /// Number of processes whose command line contains `pattern` and whose
    /// working directory is `cwd`
    fn count_running_in(&self, pattern: &str, cwd: &Path) -> usize;
}

/// Host process table read through `sysinfo`
pub struct HostProcessTable {
    system: Mutex<System>,
    own_pid: Option<Pid>,
}

impl Default for HostProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProcessTable {
    /// Creates a table that never matches the orchestrator itself
    pub fn new() -> Self {
        let own_pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("own pid unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            own_pid,
        }
    }
}

impl HostProcessTable {
    fn count(&self, pattern: &str, cwd: Option<&Path>) -> usize {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let mut refresh = ProcessRefreshKind::new().with_cmd(UpdateKind::Always);
        if cwd.is_some() {
            refresh = refresh.with_cwd(UpdateKind::Always);
        }
        system.refresh_processes_specifics(refresh);

        system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != self.own_pid)
            .filter(|(_, process)| process.cmd().join(" ").contains(pattern))
            .filter(|(_, process)| cwd.map_or(true, |dir| process.cwd() == Some(dir)))
            .count()
    }
}

impl ProcessTable for HostProcessTable {
    fn count_matching(&self, pattern: &str) -> usize {
        self.count(pattern, None)
    }

    fn count_running_in(&self, pattern: &str, cwd: &Path) -> usize {
        let dir: PathBuf = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
        self.count(pattern, Some(&dir))
    }
}

/// Polls until no process matches any pattern, returning the number of polls
/// that still found stragglers
pub async fn wait_for_stragglers(table: &dyn ProcessTable, patterns: &[String], poll: Duration) -> usize {
    let mut waits = 0;
    loop {
        let remaining: Vec<(&str, usize)> = patterns
            .iter()
            .map(|p| (p.as_str(), table.count_matching(p)))
            .filter(|(_, count)| *count > 0)
            .collect();

        if remaining.is_empty() {
            debug!("no straggler processes remain");
            return waits;
        }

        for (pattern, count) in &remaining {
            info!("Waiting for {} process(es) matching {} to exit", count, pattern);
        }
        waits += 1;
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use mockall::Sequence;

    #[tokio::test]
    async fn polls_until_every_pattern_is_gone() {
        let mut table = MockProcessTable::new();
        let mut seq = Sequence::new();
        for remaining in [2, 1, 0] {
            table
                .expect_count_matching()
                .with(eq("corda.jar"))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(remaining as usize);
        }
        table
            .expect_count_matching()
            .with(eq("signer.jar"))
            .return_const(0usize);

        let patterns = vec!["corda.jar".to_string(), "signer.jar".to_string()];
        let waits = wait_for_stragglers(&table, &patterns, Duration::from_millis(1)).await;
        assert_eq!(waits, 2);
    }

    #[tokio::test]
    async fn returns_immediately_without_stragglers() {
        let mut table = MockProcessTable::new();
        table.expect_count_matching().times(1).return_const(0usize);

        let waits = wait_for_stragglers(&table, &["zone.jar".to_string()], Duration::from_secs(60)).await;
        assert_eq!(waits, 0);
    }

    #[test]
    fn host_table_counts_live_children_only() {
        let marker = format!("3600.{}", std::process::id());
        let pattern = format!("sleep {}", marker);
        let table = HostProcessTable::new();
        assert_eq!(table.count_matching(&pattern), 0);

        let mut child = std::process::Command::new("sleep").arg(&marker).spawn().unwrap();
        assert_eq!(table.count_matching(&pattern), 1);

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(table.count_matching(&pattern), 0);
    }

    #[test]
    fn host_table_matches_the_working_directory() {
        let here = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let marker = format!("3601.{}", std::process::id());
        let pattern = format!("sleep {}", marker);
        let table = HostProcessTable::new();

        let mut child = std::process::Command::new("sleep")
            .arg(&marker)
            .current_dir(here.path())
            .spawn()
            .unwrap();
        assert_eq!(table.count_running_in(&pattern, here.path()), 1);
        assert_eq!(table.count_running_in(&pattern, elsewhere.path()), 0);

        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(table.count_running_in(&pattern, here.path()), 0);
    }
}
