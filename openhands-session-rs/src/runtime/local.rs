use crate::errors::RuntimeError;
use crate::microagent::{Microagent, loader};
use crate::runtime::{Runtime, RuntimeContext, RuntimeFactory};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info};

/// A runtime that works directly in a directory on the host machine
/// (or within the same container if the session itself is containerized).
pub struct LocalRuntime {
    sid: String,
    workspace_dir: PathBuf,
    env_vars: HashMap<String, String>,
    web_hosts: BTreeMap<String, u16>,
    connected: AtomicBool,
}

impl LocalRuntime {
    pub fn new(sid: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            sid: sid.into(),
            workspace_dir: workspace_dir.into(),
            env_vars: HashMap::new(),
            web_hosts: BTreeMap::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_env_vars(mut self, env_vars: HashMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    /// Advertises a host the agent can reach from the workspace.
    pub fn with_web_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.web_hosts.insert(host.into(), port);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn repo_dir(&self, repository: &str) -> PathBuf {
        let name = repository
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or(repository);
        self.workspace_dir.join(name)
    }
}

/// `owner/name` becomes a GitHub URL; anything with a scheme or an existing
/// local path is cloned as given.
fn clone_url(repository: &str, token: Option<&str>) -> String {
    if repository.contains("://") || Path::new(repository).exists() {
        return repository.to_string();
    }
    match token {
        Some(token) => format!("https://{}@github.com/{}.git", token, repository),
        None => format!("https://github.com/{}.git", repository),
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn connect(&self) -> Result<(), RuntimeError> {
        fs::create_dir_all(&self.workspace_dir).map_err(|e| {
            RuntimeError::Unavailable(format!(
                "cannot create workspace {}: {}",
                self.workspace_dir.display(),
                e
            ))
        })?;
        self.connected.store(true, Ordering::SeqCst);
        info!(
            sid = %self.sid,
            workspace = %self.workspace_dir.display(),
            "Local runtime connected"
        );
        Ok(())
    }

    async fn clone_repo(
        &self,
        token: Option<&str>,
        repository: &str,
        branch: Option<&str>,
    ) -> Result<PathBuf, RuntimeError> {
        let target = self.repo_dir(repository);
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--quiet");
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(clone_url(repository, token))
            .arg(&target)
            .envs(&self.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(sid = %self.sid, repository, "Cloning repository");
        let output = cmd.output().await.map_err(|e| RuntimeError::Clone {
            repo: repository.to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Some(token) = token {
                message = message.replace(token, "<secret_hidden>");
            }
            return Err(RuntimeError::Clone {
                repo: repository.to_string(),
                message,
            });
        }
        Ok(target)
    }

    fn web_hosts(&self) -> BTreeMap<String, u16> {
        self.web_hosts.clone()
    }

    async fn get_microagents_from_selected_repo(
        &self,
        repository: Option<&str>,
    ) -> Result<Vec<Microagent>, RuntimeError> {
        let root = match repository {
            Some(repository) => self.repo_dir(repository),
            None => self.workspace_dir.clone(),
        };
        let dir = root.join(loader::REPO_MICROAGENTS_DIR);
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "No workspace microagents");
            return Ok(Vec::new());
        }
        loader::load_microagents_from_dir(&dir).map_err(|e| RuntimeError::Other(e.into()))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!(sid = %self.sid, "Local runtime closed");
        Ok(())
    }
}

/// Builds one [`LocalRuntime`] per session under a shared root directory.
#[derive(Debug, Clone)]
pub struct LocalRuntimeFactory {
    workspace_root: PathBuf,
}

impl LocalRuntimeFactory {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

impl RuntimeFactory for LocalRuntimeFactory {
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn Runtime>, RuntimeError> {
        if !ctx.plugins.is_empty() {
            debug!(plugins = ?ctx.plugins, "Local runtime ignores sandbox plugins");
        }
        let runtime = LocalRuntime::new(&ctx.sid, self.workspace_root.join(&ctx.sid))
            .with_env_vars(ctx.env_vars);
        Ok(Arc::new(runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLog;
    use crate::microagent::MicroagentScope;
    use crate::status::status_channel;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn factory_creates_runtime_under_session_dir() {
        let root = tempfile::tempdir().unwrap();
        let (status, _rx) = status_channel();
        let ctx = RuntimeContext {
            sid: "abc".into(),
            event_log: Arc::new(EventLog::new("abc")),
            env_vars: HashMap::new(),
            plugins: vec!["jupyter".into()],
            status,
        };
        let runtime = LocalRuntimeFactory::new(root.path()).create(ctx).unwrap();
        runtime.connect().await.unwrap();
        assert!(root.path().join("abc").is_dir());
        runtime.close().await.unwrap();
    }

    #[tokio::test]
    async fn connect_fails_when_workspace_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("taken");
        fs::write(&blocker, "").unwrap();
        let runtime = LocalRuntime::new("s1", blocker.join("ws"));
        let err = runtime.connect().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(!runtime.is_connected());
    }

    #[tokio::test]
    async fn loads_microagents_from_selected_repo() {
        let root = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new("s1", root.path());
        write(
            &root.path().join("proj/.openhands/microagents/repo.md"),
            "---\nname: repo\ntype: repo\n---\nRun make test.",
        );
        write(
            &root.path().join("proj/.openhands/microagents/docker.md"),
            "---\nname: docker\ntype: knowledge\ntriggers: [docker]\n---\nUse compose.",
        );

        let mut agents = runtime
            .get_microagents_from_selected_repo(Some("acme/proj"))
            .await
            .unwrap();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].name, "docker");
        assert_eq!(agents[1].scope, MicroagentScope::Repository);

        assert!(runtime.get_microagents_from_selected_repo(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_clone_reports_clone_error() {
        let root = tempfile::tempdir().unwrap();
        let runtime = LocalRuntime::new("s1", root.path());
        let missing = root.path().join("does-not-exist.git");
        let missing = format!("file://{}", missing.display());
        let err = runtime.clone_repo(None, &missing, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Clone { .. }));
    }

    #[test]
    fn clone_url_uses_token_for_github_shorthand() {
        assert_eq!(clone_url("acme/proj", None), "https://github.com/acme/proj.git");
        assert_eq!(clone_url("acme/proj", Some("tok")), "https://tok@github.com/acme/proj.git");
        assert_eq!(
            clone_url("https://example.com/x.git", Some("tok")),
            "https://example.com/x.git"
        );
    }

    #[test]
    fn web_hosts_are_advertised() {
        let runtime = LocalRuntime::new("s1", "/tmp/ws").with_web_host("http://localhost", 3000);
        assert_eq!(runtime.web_hosts().get("http://localhost"), Some(&3000));
    }
}
