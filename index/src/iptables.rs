//! Host packet-filter access.
//!
//! The engine drives the filter table through the narrow [`FilterTable`]
//! contract so syncs can be exercised against an in-memory table in tests.
//! [`IptablesCmd`] is the production implementation, shelling out to the
//! `iptables` tool suite the same way the rest of the node agents drive
//! kernel state.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::{io::AsyncWriteExt, process::Command};

/// Mutation and dump primitives over the kernel filter table.
///
/// `restore` is the only operation that rewrites rules in bulk; it is atomic,
/// so a failed sync leaves the table in its pre-sync state.
#[async_trait]
pub trait FilterTable: Send + Sync {
    /// Dumps the current filter table in save format.
    async fn save(&self) -> Result<String>;

    /// Atomically replaces the filter table from a save-format payload.
    async fn restore(&self, payload: &str) -> Result<()>;

    /// Creates a chain, tolerating one that already exists.
    async fn ensure_chain(&self, chain: &str) -> Result<()>;

    async fn list_chains(&self) -> Result<Vec<String>>;

    /// Lists a chain's rules in spec (`-S`) format; the leading entries are
    /// the `-P`/`-N` declaration lines.
    async fn list_rules(&self, chain: &str) -> Result<Vec<String>>;

    async fn rule_exists(&self, chain: &str, args: &[String]) -> Result<bool>;

    /// Inserts a rule at a 1-indexed position.
    async fn insert_rule(&self, chain: &str, position: usize, args: &[String]) -> Result<()>;

    /// Appends a rule unless an identical one is already present.
    async fn append_unique(&self, chain: &str, args: &[String]) -> Result<()>;

    /// Deletes a rule by its 1-indexed number.
    async fn delete_rule(&self, chain: &str, number: usize) -> Result<()>;

    async fn flush_chain(&self, chain: &str) -> Result<()>;

    async fn delete_chain(&self, chain: &str) -> Result<()>;
}

/// Drives the host `iptables`, `iptables-save`, and `iptables-restore`
/// binaries.
#[derive(Clone, Debug, Default)]
pub struct IptablesCmd(());

impl IptablesCmd {
    pub fn new() -> Self {
        Self(())
    }

    async fn iptables(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("iptables")
            .arg("--wait")
            .args(["-t", "filter"])
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run iptables {}", args.join(" ")))?;
        Ok(output)
    }

    async fn iptables_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.iptables(args).await?;
        if !output.status.success() {
            bail!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl FilterTable for IptablesCmd {
    async fn save(&self) -> Result<String> {
        let output = Command::new("iptables-save")
            .args(["-t", "filter"])
            .output()
            .await
            .context("failed to run iptables-save")?;
        if !output.status.success() {
            bail!(
                "iptables-save failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("iptables-save produced invalid utf-8")
    }

    async fn restore(&self, payload: &str) -> Result<()> {
        let mut child = Command::new("iptables-restore")
            .arg("--wait")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn iptables-restore")?;
        child
            .stdin
            .take()
            .context("iptables-restore stdin was not captured")?
            .write_all(payload.as_bytes())
            .await
            .context("failed to write to iptables-restore")?;
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for iptables-restore")?;
        if !output.status.success() {
            bail!(
                "iptables-restore failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn ensure_chain(&self, chain: &str) -> Result<()> {
        let output = self.iptables(&["-N", chain]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_ascii_lowercase().contains("already exists") {
            return Ok(());
        }
        bail!("failed to create chain {}: {}", chain, stderr.trim());
    }

    async fn list_chains(&self) -> Result<Vec<String>> {
        let output = self.iptables(&["-S"]).await?;
        if !output.status.success() {
            bail!(
                "failed to list chains: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match parts.next() {
                    Some("-P") | Some("-N") => parts.next().map(ToString::to_string),
                    _ => None,
                }
            })
            .collect())
    }

    async fn list_rules(&self, chain: &str) -> Result<Vec<String>> {
        let output = self.iptables(&["-S", chain]).await?;
        if !output.status.success() {
            bail!(
                "failed to list rules in chain {}: {}",
                chain,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().map(ToString::to_string).collect())
    }

    async fn rule_exists(&self, chain: &str, args: &[String]) -> Result<bool> {
        let mut full = vec!["-C", chain];
        full.extend(args.iter().map(String::as_str));
        let output = self.iptables(&full).await?;
        Ok(output.status.success())
    }

    async fn insert_rule(&self, chain: &str, position: usize, args: &[String]) -> Result<()> {
        let position = position.to_string();
        let mut full = vec!["-I", chain, position.as_str()];
        full.extend(args.iter().map(String::as_str));
        self.iptables_checked(&full).await
    }

    async fn append_unique(&self, chain: &str, args: &[String]) -> Result<()> {
        if self.rule_exists(chain, args).await? {
            return Ok(());
        }
        let mut full = vec!["-A", chain];
        full.extend(args.iter().map(String::as_str));
        self.iptables_checked(&full).await
    }

    async fn delete_rule(&self, chain: &str, number: usize) -> Result<()> {
        let number = number.to_string();
        self.iptables_checked(&["-D", chain, number.as_str()]).await
    }

    async fn flush_chain(&self, chain: &str) -> Result<()> {
        self.iptables_checked(&["-F", chain]).await
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.iptables_checked(&["-X", chain]).await
    }
}
