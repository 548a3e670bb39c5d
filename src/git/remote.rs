use crate::error::GitError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Bring the local mirror at `path` up to date with `url`
///
/// Clones with `--mirror` when the mirror does not exist yet, otherwise runs
/// `git remote update --prune` inside it. The subprocess is killed when the
/// timeout elapses.
pub async fn mirror(
    git_binary: &str,
    url: &str,
    path: &Path,
    timeout: Duration,
) -> Result<(), GitError> {
    let mut cmd = Command::new(git_binary);
    let operation = if path.join("HEAD").exists() {
        cmd.args(["remote", "update", "--prune"]).current_dir(path);
        "git remote update"
    } else {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fetch_failed(url, format!("failed to create {}: {}", parent.display(), e)))?;
        }
        cmd.arg("clone").arg("--mirror").arg(url).arg(path);
        "git clone --mirror"
    };

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.kill_on_drop(true);

    tracing::info!("Running {} for {}", operation, url);
    let child = cmd
        .spawn()
        .map_err(|e| fetch_failed(url, format!("failed to spawn {}: {}", git_binary, e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| fetch_failed(url, format!("{} wait failed: {}", operation, e)))?,
        Err(_) => {
            return Err(GitError::Timeout {
                operation: format!("{} of {}", operation, url),
                secs: timeout.as_secs(),
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(fetch_failed(
            url,
            format!("{} exited with {}: {}", operation, output.status, stderr.trim()),
        ));
    }

    Ok(())
}

fn fetch_failed(url: &str, reason: String) -> GitError {
    GitError::FetchFailed {
        url: url.to_string(),
        reason,
    }
}

/// Repository name derived from the last path segment of a clone URL
///
/// `https://host/scm/acme/webapp.git` and `git@host:acme/webapp` both yield
/// `webapp`.
pub fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}
