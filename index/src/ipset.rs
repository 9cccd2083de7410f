//! Host IP-set access.
//!
//! Rules reference sets by name, so membership can change without rewriting
//! rules. `refresh` swaps in a fully-built temporary set so a referencing
//! rule never observes half-updated membership.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Mutation and enumeration primitives over the kernel IP-set universe.
#[async_trait]
pub trait Ipsets: Send + Sync {
    /// Creates a set if it does not already exist.
    async fn ensure(&self, name: &str, set_type: &str, options: &[&str]) -> Result<()>;

    /// Atomically replaces the membership of a set, creating it if needed.
    async fn refresh(
        &self,
        name: &str,
        set_type: &str,
        options: &[&str],
        members: &[String],
    ) -> Result<()>;

    async fn destroy(&self, name: &str) -> Result<()>;

    /// Names of all sets currently present on the host.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Drives the host `ipset` binary.
#[derive(Clone, Debug, Default)]
pub struct IpsetCmd(());

impl IpsetCmd {
    pub fn new() -> Self {
        Self(())
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("ipset")
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run ipset {}", args.join(" ")))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            bail!(
                "ipset {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Ipsets for IpsetCmd {
    async fn ensure(&self, name: &str, set_type: &str, options: &[&str]) -> Result<()> {
        let mut args = vec!["create", name, set_type];
        args.extend_from_slice(options);
        args.push("-exist");
        self.run_checked(&args).await
    }

    async fn refresh(
        &self,
        name: &str,
        set_type: &str,
        options: &[&str],
        members: &[String],
    ) -> Result<()> {
        self.ensure(name, set_type, options).await?;

        // Build the replacement membership in a scratch set, then swap it in.
        let tmp = format!("{name}-tmp");
        self.ensure(&tmp, set_type, options).await?;
        self.run_checked(&["flush", &tmp]).await?;
        for member in members {
            self.run_checked(&["add", &tmp, member, "-exist"]).await?;
        }
        self.run_checked(&["swap", &tmp, name]).await?;
        self.run_checked(&["destroy", &tmp]).await
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.run_checked(&["destroy", name]).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let output = self.run(&["list", "-n"]).await?;
        if !output.status.success() {
            bail!(
                "ipset list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }
}
