//! Command control plane — shells out to external provisioning tools.
//!
//! `provision_command <group>` is run once per requested runner in the
//! background. The last non-empty line of its stdout must read
//! `<runner-id> <address>`. `remove_command <group> <runner-id>` is run
//! inline; the runner is forgotten once it exits successfully.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use nodepool_core::Runner;
use nodepool_core::config::ControlPlaneConfig;

use crate::ControlPlane;
use crate::error::{ControlPlaneError, ControlPlaneResult};

pub struct CommandControlPlane {
    provision: Arc<Vec<String>>,
    remove: Vec<String>,
    runners: Arc<RwLock<HashMap<String, Vec<Runner>>>>,
    capacity: i64,
}

impl CommandControlPlane {
    pub fn new(provision: Vec<String>, remove: Vec<String>, capacity: i64) -> ControlPlaneResult<Self> {
        if provision.is_empty() || remove.is_empty() {
            return Err(ControlPlaneError::Misconfigured(
                "command control plane needs provision_command and remove_command".into(),
            ));
        }
        Ok(Self {
            provision: Arc::new(provision),
            remove,
            runners: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        })
    }

    pub fn from_config(config: &ControlPlaneConfig) -> ControlPlaneResult<Self> {
        Self::new(
            config.provision_command.clone(),
            config.remove_command.clone(),
            config.runner_capacity_mb,
        )
    }
}

#[async_trait]
impl ControlPlane for CommandControlPlane {
    fn name(&self) -> &str {
        "command"
    }

    async fn get_lbg_runners(&self, group: &str) -> ControlPlaneResult<Vec<Runner>> {
        let runners = self.runners.read().await;
        Ok(runners.get(group).cloned().unwrap_or_default())
    }

    async fn provision_runners(&self, group: &str, n: usize) -> ControlPlaneResult<usize> {
        for _ in 0..n {
            let argv = Arc::clone(&self.provision);
            let runners = Arc::clone(&self.runners);
            let group = group.to_string();
            let capacity = self.capacity;

            tokio::spawn(async move {
                let stdout = match run(&argv, &[&group]).await {
                    Ok(out) => out,
                    Err(e) => {
                        warn!(%group, error = %e, "runner provisioning failed");
                        return;
                    }
                };
                match parse_runner(&stdout, capacity) {
                    Ok(runner) => {
                        info!(%group, runner = %runner.id, address = %runner.address, "runner provisioned");
                        runners.write().await.entry(group).or_default().push(runner);
                    }
                    Err(e) => warn!(%group, error = %e, "unparseable provisioning output"),
                }
            });
        }
        Ok(n)
    }

    async fn remove_runner(&self, group: &str, id: &str) -> ControlPlaneResult<()> {
        run(&self.remove, &[group, id]).await?;

        let mut map = self.runners.write().await;
        if let Some(runners) = map.get_mut(group) {
            runners.retain(|r| r.id != id);
        }
        info!(%group, runner = %id, "runner removed");
        Ok(())
    }
}

/// Run `argv` with `extra` appended and return its stdout.
async fn run(argv: &[String], extra: &[&str]) -> ControlPlaneResult<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ControlPlaneError::Misconfigured("empty command".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).args(extra).kill_on_drop(true);
    debug!(?cmd, "running control plane command");

    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(ControlPlaneError::Command {
            command: program.clone(),
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `<id> <address>` from the last non-empty output line.
fn parse_runner(stdout: &str, capacity: i64) -> ControlPlaneResult<Runner> {
    let bad = || ControlPlaneError::Command {
        command: "provision".into(),
        reason: format!("expected `<id> <address>`, got {stdout:?}"),
    };

    let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).ok_or_else(bad)?;
    let mut fields = line.split_whitespace();
    let (Some(id), Some(address), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(bad());
    };

    Ok(Runner {
        id: id.to_string(),
        address: address.to_string(),
        capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str, name: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), name.into()]
    }

    #[test]
    fn parse_runner_uses_last_line() {
        let runner = parse_runner("booting...\nr-1 10.0.0.5:9190\n\n", 2048).unwrap();
        assert_eq!(runner.id, "r-1");
        assert_eq!(runner.address, "10.0.0.5:9190");
        assert_eq!(runner.capacity, 2048);
    }

    #[test]
    fn parse_runner_rejects_malformed_output() {
        assert!(parse_runner("", 1).is_err());
        assert!(parse_runner("only-an-id", 1).is_err());
        assert!(parse_runner("a b c", 1).is_err());
    }

    #[test]
    fn missing_commands_are_rejected() {
        assert!(CommandControlPlane::new(vec![], vec!["true".into()], 1).is_err());
        assert!(CommandControlPlane::new(vec!["true".into()], vec![], 1).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn provision_then_remove() {
        let cp = CommandControlPlane::new(
            sh("echo \"r-$1 10.0.0.9:9190\"", "provision"),
            sh("test \"$2\" = \"r-g1\"", "remove"),
            4096,
        )
        .unwrap();

        assert_eq!(cp.provision_runners("g1", 1).await.unwrap(), 1);

        let mut runners = Vec::new();
        for _ in 0..100 {
            runners = cp.get_lbg_runners("g1").await.unwrap();
            if !runners.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].id, "r-g1");
        assert_eq!(runners[0].address, "10.0.0.9:9190");

        cp.remove_runner("g1", "r-g1").await.unwrap();
        assert!(cp.get_lbg_runners("g1").await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_remove_keeps_runner_and_reports_stderr() {
        let cp = CommandControlPlane::new(
            sh("echo \"r-1 10.0.0.9:9190\"", "provision"),
            sh("echo busy >&2; exit 3", "remove"),
            4096,
        )
        .unwrap();
        cp.runners.write().await.insert(
            "g1".into(),
            vec![Runner {
                id: "r-1".into(),
                address: "10.0.0.9:9190".into(),
                capacity: 4096,
            }],
        );

        let err = cp.remove_runner("g1", "r-1").await.unwrap_err();
        assert!(err.to_string().contains("busy"));
        assert_eq!(cp.get_lbg_runners("g1").await.unwrap().len(), 1);
    }
}
