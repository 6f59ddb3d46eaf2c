//! External installer collaborator: runs the mesh CLI to generate the install manifest.

use std::io::Write;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Produces the control-plane manifest for a namespace.
#[async_trait::async_trait]
pub trait Installer: Send + Sync {
    /// Manifest YAML for installing (or, with `delete`, removing) the control plane.
    async fn manifest(&self, namespace: &str, delete: bool) -> Result<String>;
}

/// Shells out to the `linkerd` CLI with a private copy of the session kubeconfig.
#[derive(Debug, Clone)]
pub struct LinkerdCli {
    bin: String,
    ns_flag: String,
    kubeconfig: Vec<u8>,
    context: Option<String>,
}

impl LinkerdCli {
    pub fn new(bin: impl Into<String>, ns_flag: impl Into<String>, kubeconfig: Vec<u8>, context: Option<String>) -> Self {
        Self { bin: bin.into(), ns_flag: ns_flag.into(), kubeconfig, context: context.filter(|c| !c.is_empty()) }
    }

    /// Arguments shared by the check and install invocations.
    pub fn base_args(&self, namespace: &str, kubeconfig_path: Option<&str>) -> Vec<String> {
        let mut args = vec![self.ns_flag.clone(), namespace.to_string()];
        if let Some(ctx) = &self.context {
            args.push("--context".into());
            args.push(ctx.clone());
        }
        if let Some(path) = kubeconfig_path {
            args.push("--kubeconfig".into());
            args.push(path.to_string());
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<(String, String)> {
        let t0 = Instant::now();
        debug!(bin = %self.bin, args = ?args, "running installer");
        let out = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.bin))?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        debug!(status = ?out.status.code(), took_ms = %t0.elapsed().as_millis(), "installer exited");
        if !out.status.success() {
            error!(bin = %self.bin, stderr = %stderr.trim(), "installer failed");
            bail!("{} exited with {}: {}", self.bin, out.status, stderr.trim());
        }
        Ok((stdout, stderr))
    }
}

#[async_trait::async_trait]
impl Installer for LinkerdCli {
    async fn manifest(&self, namespace: &str, delete: bool) -> Result<String> {
        // dropped (and removed) when this call returns
        let mut file = tempfile::Builder::new().prefix("kubeconfig_").tempfile().context("creating temporary kubeconfig")?;
        let path = if self.kubeconfig.is_empty() {
            None
        } else {
            file.write_all(&self.kubeconfig).context("writing temporary kubeconfig")?;
            file.flush().context("writing temporary kubeconfig")?;
            Some(file.path().to_string_lossy().into_owned())
        };
        let base = self.base_args(namespace, path.as_deref());

        if !delete {
            let mut check = base.clone();
            check.extend(["check".to_string(), "--pre".to_string()]);
            self.run(&check).await.context("pre-flight check")?;
        }

        let mut install = base;
        install.extend(["install".to_string(), "--ignore-cluster".to_string()]);
        let (yaml, stderr) = self.run(&install).await.context("generating install manifest")?;
        if !stderr.trim().is_empty() {
            bail!("received error while attempting to prepare install yaml: {}", stderr.trim());
        }
        info!(namespace, bytes = yaml.len(), "install manifest generated");
        Ok(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_flag_convention() {
        let cli = LinkerdCli::new("linkerd", "--namespace", b"apiVersion: v1".to_vec(), Some("kind-a".into()));
        assert_eq!(
            cli.base_args("linkerd", Some("/tmp/kc")),
            vec!["--namespace", "linkerd", "--context", "kind-a", "--kubeconfig", "/tmp/kc"]
        );
        let cli = LinkerdCli::new("linkerd", "--linkerd-namespace", Vec::new(), Some(String::new()));
        assert_eq!(cli.base_args("mesh", None), vec!["--linkerd-namespace", "mesh"]);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let cli = LinkerdCli::new("/nonexistent/meshd-installer", "--namespace", Vec::new(), None);
        let err = cli.manifest("linkerd", true).await.unwrap_err();
        assert!(format!("{:#}", err).contains("spawning /nonexistent/meshd-installer"), "err={:#}", err);
    }
}
