//! Component lifecycle engine (C7, §4.7).
//!
//! Materializes content (download + verify + extract), starts/stops/
//! restarts supervised processes, and runs unmanaged scripts once,
//! streaming their output upstream via the `ProgressReporter`.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cosmos_common::proto::{self, ComponentDeployment, ComponentStatus as ProtoComponentStatus, DeploymentResult};
use cosmos_common::{sha256_hex, CosmosError, RunStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::progress::ProgressReporter;
use crate::store::{AgentStore, ComponentRow, ComponentStatusRow, NewDeploymentLogEntry};

const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const PROGRESS_CHUNK_INTERVAL: Duration = Duration::from_secs(3);
const PROGRESS_CHUNK_MAX_BYTES: usize = 4096;

pub struct LifecycleEngine {
    store: Arc<dyn AgentStore>,
    progress: Arc<dyn ProgressReporter>,
    http: reqwest::Client,
    programs_dir: PathBuf,
    scripts_dir: PathBuf,
    logs_dir: PathBuf,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn AgentStore>,
        progress: Arc<dyn ProgressReporter>,
        programs_dir: PathBuf,
        scripts_dir: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        Self { store, progress, http: reqwest::Client::new(), programs_dir, scripts_dir, logs_dir }
    }

    /// §4.7 "Deployment inbound handling".
    pub async fn handle_deployment(&self, cmd: ComponentDeployment) {
        self.progress
            .report_deployment(DeploymentResult {
                component_name: cmd.component_name.clone(),
                operation: "deploy".to_string(),
                result: "received".to_string(),
                message: String::new(),
                timestamp: Utc::now().timestamp(),
            })
            .await;

        self.progress
            .report_deployment(DeploymentResult {
                component_name: cmd.component_name.clone(),
                operation: "deploy".to_string(),
                result: "started".to_string(),
                message: String::new(),
                timestamp: Utc::now().timestamp(),
            })
            .await;

        let operation = if cmd.component_type == "program" { "deploy-program" } else { "deploy-script" };
        let result = if cmd.component_type == "program" {
            self.deploy_program(&cmd).await
        } else {
            self.deploy_script(&cmd).await
        };

        match result {
            Ok(()) => {
                self.progress
                    .report_deployment(DeploymentResult {
                        component_name: cmd.component_name.clone(),
                        operation: operation.to_string(),
                        result: "success".to_string(),
                        message: String::new(),
                        timestamp: Utc::now().timestamp(),
                    })
                    .await;

                let status = self.store.get_component_status(&cmd.component_name).await.unwrap_or_else(|_| {
                    ComponentStatusRow::default_for(&cmd.component_name)
                });
                self.report_status(&status).await;

                if let Some(hc) = &cmd.health_check {
                    let _ = self
                        .store
                        .upsert_health_check(crate::store::HealthCheckRow {
                            name: cmd.component_name.clone(),
                            check_type: hc.r#type.clone(),
                            endpoint: hc.endpoint.clone(),
                            interval_seconds: hc.interval_seconds as i64,
                            timeout_seconds: hc.timeout_seconds as i64,
                            retries: hc.retries as i64,
                            last_check_at: None,
                            last_result: "empty".to_string(),
                            consecutive_failures: 0,
                        })
                        .await;
                }

                let _ = self
                    .store
                    .append_log(NewDeploymentLogEntry {
                        component_name: cmd.component_name.clone(),
                        operation: operation.to_string(),
                        status: "success".to_string(),
                        message: None,
                    })
                    .await;
            }
            Err(err) => {
                warn!(component = %cmd.component_name, %err, "deployment failed");
                self.progress
                    .report_deployment(DeploymentResult {
                        component_name: cmd.component_name.clone(),
                        operation: operation.to_string(),
                        result: "failure".to_string(),
                        message: err.to_string(),
                        timestamp: Utc::now().timestamp(),
                    })
                    .await;
                let _ = self
                    .store
                    .append_log(NewDeploymentLogEntry {
                        component_name: cmd.component_name.clone(),
                        operation: operation.to_string(),
                        status: "failure".to_string(),
                        message: Some(err.to_string()),
                    })
                    .await;
            }
        }
    }

    /// §4.7 "Remove".
    pub async fn handle_removal(&self, component_name: &str) {
        match self.remove(component_name).await {
            Ok(()) => {
                let _ = self
                    .store
                    .append_log(NewDeploymentLogEntry {
                        component_name: component_name.to_string(),
                        operation: "remove".to_string(),
                        status: "success".to_string(),
                        message: None,
                    })
                    .await;
                self.progress
                    .report_deployment(DeploymentResult {
                        component_name: component_name.to_string(),
                        operation: "remove".to_string(),
                        result: "success".to_string(),
                        message: String::new(),
                        timestamp: Utc::now().timestamp(),
                    })
                    .await;
            }
            Err(err) => {
                warn!(component = component_name, %err, "removal failed");
                let _ = self
                    .store
                    .append_log(NewDeploymentLogEntry {
                        component_name: component_name.to_string(),
                        operation: "remove".to_string(),
                        status: "failure".to_string(),
                        message: Some(err.to_string()),
                    })
                    .await;
                self.progress
                    .report_deployment(DeploymentResult {
                        component_name: component_name.to_string(),
                        operation: "remove".to_string(),
                        result: "failure".to_string(),
                        message: err.to_string(),
                        timestamp: Utc::now().timestamp(),
                    })
                    .await;
            }
        }
    }

    async fn report_status(&self, status: &ComponentStatusRow) {
        self.progress
            .report_status(ProtoComponentStatus {
                name: status.name.clone(),
                status: status.status.clone(),
                message: status.message.clone(),
                pid: status.pid.unwrap_or(0),
                restart_count: status.restart_count as i32,
                last_started_at: status.last_started_at.map(|t| t.timestamp()),
            })
            .await;
    }

    /// §4.7 "Deploy program".
    pub async fn deploy_program(&self, cmd: &ComponentDeployment) -> anyhow::Result<()> {
        if let Some(existing) = self.store.get_component(&cmd.component_name).await? {
            if existing.hash == cmd.hash {
                return Ok(());
            }
        }

        let (content, _temp_guard) = if !cmd.content.is_empty() {
            (cmd.content.clone(), None)
        } else {
            let (temp, bytes) = self.download_to_temp(&cmd.content_url).await?;
            (bytes, Some(temp))
        };

        let actual_hash = sha256_hex(&content);
        if actual_hash != cmd.hash {
            return Err(CosmosError::HashMismatch { expected: cmd.hash.clone(), actual: actual_hash }.into());
        }

        let dest = self.programs_dir.join(&cmd.component_name);
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await.ok();
        }
        tokio::fs::create_dir_all(&dest).await?;

        match cmd.content_url_encoding.as_str() {
            "tar.gz" | "tgz" => extract_tar_gz(&content, &dest)?,
            "zip" => extract_zip(&content, &dest)?,
            _ => {
                let file_path = dest.join(&cmd.component_name);
                tokio::fs::write(&file_path, &content).await?;
                set_executable(&file_path)?;
            }
        }

        let executable = locate_executable(&dest, &cmd.component_name)?;

        // best-effort stop of the prior version before replacing it
        let _ = self.stop(&cmd.component_name).await;

        let row = ComponentRow {
            name: cmd.component_name.clone(),
            kind: "program".to_string(),
            hash: cmd.hash.clone(),
            source_url: if cmd.content_url.is_empty() { None } else { Some(cmd.content_url.clone()) },
            encoding: Some(cmd.content_url_encoding.clone()),
            content_inline: None,
            executable_path: Some(executable.to_string_lossy().to_string()),
            env_json: serde_json::to_string(&cmd.env)?,
            args_json: serde_json::to_string(&cmd.args)?,
            managed: cmd.managed,
        };
        self.store.upsert_component(row).await?;
        self.start(&cmd.component_name).await?;
        Ok(())
    }

    /// §4.7 "Deploy script".
    pub async fn deploy_script(&self, cmd: &ComponentDeployment) -> anyhow::Result<()> {
        if let Some(existing) = self.store.get_component(&cmd.component_name).await? {
            if existing.hash == cmd.hash {
                return Ok(());
            }
        }

        let content = if !cmd.content.is_empty() {
            cmd.content.clone()
        } else {
            let (_temp, bytes) = self.download_to_temp(&cmd.content_url).await?;
            bytes
        };

        let actual_hash = sha256_hex(&content);
        if actual_hash != cmd.hash {
            return Err(CosmosError::HashMismatch { expected: cmd.hash.clone(), actual: actual_hash }.into());
        }

        tokio::fs::create_dir_all(&self.scripts_dir).await?;
        let path = self.scripts_dir.join(format!("{}.sh", cmd.component_name));
        tokio::fs::write(&path, &content).await?;
        set_executable(&path)?;

        let row = ComponentRow {
            name: cmd.component_name.clone(),
            kind: "script".to_string(),
            hash: cmd.hash.clone(),
            source_url: if cmd.content_url.is_empty() { None } else { Some(cmd.content_url.clone()) },
            encoding: None,
            content_inline: Some(content),
            executable_path: Some(path.to_string_lossy().to_string()),
            env_json: serde_json::to_string(&cmd.env)?,
            args_json: serde_json::to_string(&cmd.args)?,
            managed: cmd.managed,
        };
        self.store.upsert_component(row).await?;

        if cmd.managed {
            self.start(&cmd.component_name).await?;
        } else {
            self.run_unmanaged_script(&path, &cmd.env, &cmd.args, &cmd.component_name).await?;
        }
        Ok(())
    }

    async fn run_unmanaged_script(
        &self,
        path: &Path,
        env: &std::collections::HashMap<String, String>,
        args: &[String],
        name: &str,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.logs_dir).await?;
        let log_path = self.logs_dir.join(format!("{name}.log"));

        let mut command = tokio::process::Command::new(path);
        command.args(args);
        command.envs(env.clone());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout piped");

        let log_file = tokio::fs::OpenOptions::new().create(true).append(true).open(&log_path).await?;
        let progress = self.progress.clone();
        let name_owned = name.to_string();
        let tail_task = tokio::spawn(async move { tail_into_log(stdout, log_file, progress, name_owned).await });

        let status = child.wait().await?;
        tail_task.await.ok();

        if status.success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("unmanaged script exited with {status}"))
        }
    }

    async fn download_to_temp(&self, url: &str) -> anyhow::Result<(tempfile::NamedTempFile, Vec<u8>)> {
        let mut response = self.http.get(url).send().await?.error_for_status()?;
        let temp = tempfile::Builder::new().prefix("cosmos-download-").tempfile()?;
        let mut file = tokio::fs::File::create(temp.path()).await?;
        let mut collected = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            collected.extend_from_slice(&chunk);
        }
        file.flush().await?;
        Ok((temp, collected))
    }

    /// §4.7 "Start".
    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        let mut status = self.store.get_component_status(name).await?;
        if status.run_status() == RunStatus::Running {
            if let Some(pid) = status.pid {
                if is_process_alive(pid) {
                    return Ok(());
                }
            }
        }

        let component = self
            .store
            .get_component(name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("component {name} has no stored definition"))?;
        let executable =
            component.executable_path.clone().ok_or_else(|| anyhow::anyhow!("component {name} has no executable path"))?;
        let exe_path = PathBuf::from(&executable);
        let working_dir = exe_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

        tokio::fs::create_dir_all(&self.logs_dir).await?;
        let log_path = self.logs_dir.join(format!("{name}.log"));
        let log_out = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;
        let log_err = log_out.try_clone()?;

        let mut command = tokio::process::Command::new(&exe_path);
        command.args(component.args());
        command.current_dir(&working_dir);
        command.envs(component.env());
        command.stdout(std::process::Stdio::from(log_out));
        command.stderr(std::process::Stdio::from(log_err));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                status.status = "failed".to_string();
                status.message = err.to_string();
                let _ = self.store.upsert_component_status(status).await;
                return Err(err.into());
            }
        };
        let pid = child.id().ok_or_else(|| anyhow::anyhow!("spawned child has no pid"))? as i32;

        status.status = RunStatus::Running.as_str().to_string();
        status.message = String::new();
        status.pid = Some(pid);
        status.last_started_at = Some(Utc::now());
        status.last_checked_at = Utc::now();
        self.store.upsert_component_status(status).await?;

        let store = self.store.clone();
        let progress = self.progress.clone();
        let name_owned = name.to_string();
        tokio::spawn(async move {
            let message = match child.wait().await {
                Ok(exit_status) => format!("process exited: {exit_status}"),
                Err(err) => format!("wait failed: {err}"),
            };
            let mut current = store
                .get_component_status(&name_owned)
                .await
                .unwrap_or_else(|_| ComponentStatusRow::default_for(&name_owned));
            current.status = RunStatus::Stopped.as_str().to_string();
            current.message = message.clone();
            current.pid = None;
            current.last_checked_at = Utc::now();
            let restart_count = current.restart_count;
            if let Err(err) = store.upsert_component_status(current).await {
                warn!(component = %name_owned, %err, "failed to record process exit");
            }
            progress
                .report_status(ProtoComponentStatus {
                    name: name_owned,
                    status: "stopped".to_string(),
                    message,
                    pid: 0,
                    restart_count: restart_count as i32,
                    last_started_at: None,
                })
                .await;
        });

        Ok(())
    }

    /// §4.7 "Stop".
    pub async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let mut status = self.store.get_component_status(name).await?;
        if status.run_status() != RunStatus::Running {
            return Ok(());
        }

        let pid = match status.pid {
            Some(pid) if pid > 0 => pid,
            _ => {
                status.status = RunStatus::Stopped.as_str().to_string();
                self.store.upsert_component_status(status).await?;
                return Ok(());
            }
        };

        if !is_process_alive(pid) {
            status.status = RunStatus::Stopped.as_str().to_string();
            status.pid = None;
            self.store.upsert_component_status(status).await?;
            return Ok(());
        }

        send_signal(pid, nix::sys::signal::Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + FORCE_KILL_TIMEOUT;
        let mut message = String::new();
        loop {
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
            if !is_process_alive(pid) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                send_signal(pid, nix::sys::signal::Signal::SIGKILL);
                message = "Forcefully killed after timeout".to_string();
                break;
            }
        }

        let mut status = self.store.get_component_status(name).await?;
        status.status = RunStatus::Stopped.as_str().to_string();
        status.message = message;
        status.pid = None;
        status.last_checked_at = Utc::now();
        self.store.upsert_component_status(status).await?;
        Ok(())
    }

    /// §4.7 "Restart".
    pub async fn restart(&self, name: &str) -> anyhow::Result<()> {
        let mut status = self.store.get_component_status(name).await?;
        status.restart_count += 1;
        self.store.upsert_component_status(status).await?;

        let _ = self.stop(name).await;
        tokio::time::sleep(RESTART_BACKOFF).await;
        self.start(name).await
    }

    /// §4.7 "Remove".
    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let _ = self.stop(name).await;

        if let Some(component) = self.store.get_component(name).await? {
            match component.kind.as_str() {
                "program" => {
                    let dir = self.programs_dir.join(name);
                    if dir.starts_with(&self.programs_dir) {
                        let _ = tokio::fs::remove_dir_all(&dir).await;
                    }
                }
                "script" => {
                    let path = self.scripts_dir.join(format!("{name}.sh"));
                    if path.starts_with(&self.scripts_dir) {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
                _ => {}
            }
        }

        self.store.delete_component(name).await?;
        info!(component = name, "component removed");
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn AgentStore> {
        &self.store
    }
}

async fn tail_into_log(
    stdout: tokio::process::ChildStdout,
    log_file: tokio::fs::File,
    progress: Arc<dyn ProgressReporter>,
    name: String,
) {
    let mut reader = stdout;
    let mut writer = tokio::io::BufWriter::new(log_file);
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    let mut offset: i64 = 0;
    let mut last_emit = tokio::time::Instant::now();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let _ = writer.write_all(&buf[..n]).await;
                pending.extend_from_slice(&buf[..n]);
                if last_emit.elapsed() >= PROGRESS_CHUNK_INTERVAL {
                    offset = flush_pending(&progress, &name, &mut pending, offset).await;
                    last_emit = tokio::time::Instant::now();
                }
            }
            Err(_) => break,
        }
    }
    if !pending.is_empty() {
        flush_pending(&progress, &name, &mut pending, offset).await;
    }
    let _ = writer.flush().await;
}

/// Drains `pending` in `PROGRESS_CHUNK_MAX_BYTES` slices, reporting each
/// as a separate log chunk so no buffered output is silently dropped
/// between emits, and returns the advanced offset.
async fn flush_pending(
    progress: &Arc<dyn ProgressReporter>,
    name: &str,
    pending: &mut Vec<u8>,
    mut offset: i64,
) -> i64 {
    for chunk in pending.chunks(PROGRESS_CHUNK_MAX_BYTES) {
        progress.report_log_chunk(name, chunk.to_vec(), offset).await;
        offset += chunk.len() as i64;
    }
    pending.clear();
    offset
}

/// Signal-0 liveness probe (§4.7 "Is-process-alive"): no effect on the
/// target, false iff the process no longer exists or we cannot signal it.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn send_signal(pid: i32, signal: nix::sys::signal::Signal) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal);
}

fn set_executable(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Walks the extracted tree for the component's executable: a basename
/// match wins, otherwise the first executable entry (§4.7 step 4).
fn locate_executable(root: &Path, component_name: &str) -> anyhow::Result<PathBuf> {
    let mut first_executable: Option<PathBuf> = None;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(path);
                continue;
            }
            if !is_executable(&metadata) {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(component_name) {
                return Ok(path);
            }
            if first_executable.is_none() {
                first_executable = Some(path);
            }
        }
    }
    first_executable.ok_or_else(|| anyhow::anyhow!("no executable found in extracted archive for {component_name}"))
}

/// Joins `rel` onto `dest`, rejecting any component that would escape
/// it (§4.7 step 3, §8 invariant 3 "archive safety").
fn safe_join(dest: &Path, rel: &Path) -> anyhow::Result<PathBuf> {
    let mut result = dest.to_path_buf();
    for component in rel.components() {
        match component {
            std::path::Component::Normal(part) => result.push(part),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir | std::path::Component::RootDir | std::path::Component::Prefix(_) => {
                return Err(CosmosError::ArchiveTraversal(rel.display().to_string()).into());
            }
        }
    }
    if !result.starts_with(dest) {
        return Err(CosmosError::ArchiveTraversal(rel.display().to_string()).into());
    }
    Ok(result)
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    let decoder = flate2::read::GzDecoder::new(Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.to_path_buf();
        let out_path = safe_join(dest, &rel)?;
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&out_path)?;
    }
    Ok(())
}

fn extract_zip(bytes: &[u8], dest: &Path) -> anyhow::Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let rel = file
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| CosmosError::ArchiveTraversal(file.name().to_string()))?;
        let out_path = safe_join(dest, &rel)?;

        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_parent_traversal() {
        let dest = Path::new("/data/programs/foo");
        let err = safe_join(dest, Path::new("../../etc/passwd")).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn safe_join_rejects_absolute_paths() {
        let dest = Path::new("/data/programs/foo");
        let err = safe_join(dest, Path::new("/etc/passwd")).unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn safe_join_accepts_nested_relative_paths() {
        let dest = Path::new("/data/programs/foo");
        let joined = safe_join(dest, Path::new("bin/run")).unwrap();
        assert_eq!(joined, Path::new("/data/programs/foo/bin/run"));
    }

    #[test]
    fn is_process_alive_is_false_for_invalid_pid() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }

    #[test]
    fn is_process_alive_true_for_self() {
        assert!(is_process_alive(std::process::id() as i32));
    }
}
