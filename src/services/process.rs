//! Child-process helper shared by the shell-backed adapters.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Combined stdout/stderr and exit code (-1 when killed by a signal).
pub(crate) async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(&str, &str)],
) -> anyhow::Result<(String, i32)> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let output = cmd.output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok((format!("{}\n{}", stdout, stderr), output.status.code().unwrap_or(-1)))
}

/// Run through `sh -c`, for operator-configured command lines.
pub(crate) async fn run_shell(line: &str, cwd: Option<&Path>, envs: &[(&str, &str)]) -> anyhow::Result<(String, i32)> {
    run_command("sh", &["-c", line], cwd, envs).await
}
