//! Platform collaborators: process control and clipboard.
//!
//! App commands are spawned into their own process group so that an app
//! which forks (launchers, wrappers, shells) can still be terminated as a
//! unit. Input injection, audio capture, and the real clipboard backend
//! are external collaborators; the [`Clipboard`] trait is their seam.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{HostError, Result};

/// Where a spawned command's output goes, from the app's `output` field:
/// empty → inherit the host log, `"null"` → discard, path → append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    Inherit,
    Discard,
    Append(PathBuf),
}

impl OutputMode {
    pub fn from_config(output: &str) -> Self {
        match output {
            "" => OutputMode::Inherit,
            "null" => OutputMode::Discard,
            path => OutputMode::Append(PathBuf::from(path)),
        }
    }

    fn stdio(&self) -> Result<(Stdio, Stdio)> {
        Ok(match self {
            OutputMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
            OutputMode::Discard => (Stdio::null(), Stdio::null()),
            OutputMode::Append(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let clone = file.try_clone()?;
                (Stdio::from(file), Stdio::from(clone))
            }
        })
    }
}

/// Split a command line into tokens, honouring double quotes.
pub fn split_command(cmd: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in cmd.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Resolve the working directory for a command with none configured: the
/// parent directory of the resolved executable. URLs and unresolvable
/// commands yield `None` (spawn from the host's cwd).
pub fn find_working_directory(cmd: &str) -> Option<PathBuf> {
    let parts = split_command(cmd);
    let target = parts.first()?;
    if target.contains("://") {
        return None;
    }

    let path = PathBuf::from(target);
    let resolved = if path.is_absolute() {
        path
    } else {
        search_path(target)?
    };
    debug!("resolved target [{target}] to [{}]", resolved.display());
    resolved.parent().map(Path::to_path_buf)
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Spawn `cmd` with the given environment. `elevated` is accepted for
/// config compatibility; privilege separation is a platform collaborator
/// and the flag is only logged here.
///
/// The child is placed in a fresh process group whose id equals its pid.
pub fn run_command(
    elevated: bool,
    cmd: &str,
    working_dir: Option<&Path>,
    env: &HashMap<String, String>,
    output: &OutputMode,
) -> Result<tokio::process::Child> {
    let parts = split_command(cmd);
    if parts.is_empty() {
        return Err(HostError::Process("empty command".into()));
    }
    if elevated {
        info!("command [{cmd}] requests elevation");
    }

    let (stdout, stderr) = output.stdio()?;

    let mut command = std::process::Command::new(&parts[0]);
    command
        .args(&parts[1..])
        .envs(env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = tokio::process::Command::from(command).spawn().map_err(|e| {
        warn!("couldn't run [{cmd}]: {e}");
        HostError::Io(e)
    })?;
    Ok(child)
}

/// Whether any process in `pgid`'s group is still alive.
#[cfg(unix)]
pub fn process_group_running(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

/// Politely ask every process in the group to exit.
#[cfg(unix)]
pub fn request_process_group_exit(pgid: u32) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    killpg(Pid::from_raw(pgid as i32), Signal::SIGTERM).is_ok()
}

/// Forcefully kill every process in the group.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
}

/// Terminate a process group: request a graceful exit, poll once per
/// second up to `exit_timeout`, then force-kill whatever remains.
pub async fn terminate_process_group(
    child: &mut Option<tokio::process::Child>,
    pgid: Option<u32>,
    exit_timeout: Duration,
) {
    if let Some(pgid) = pgid {
        if process_group_running(pgid) {
            if exit_timeout > Duration::ZERO && request_process_group_exit(pgid) {
                info!(
                    "requested the app to exit, waiting up to {} second(s)",
                    exit_timeout.as_secs()
                );
                let mut remaining = exit_timeout.as_secs() as i64;
                while process_group_running(pgid) && remaining > 0 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    remaining -= 1;
                }
                if process_group_running(pgid) {
                    warn!("app did not exit within the timeout, terminating remaining processes");
                } else {
                    info!("all app processes exited");
                }
            } else if exit_timeout > Duration::ZERO {
                info!("app ignored the termination request, killing its processes");
            } else {
                info!("no graceful exit timeout for this app, killing its processes");
            }
            kill_process_group(pgid);
        }
    }

    // Reap the direct child to avoid a zombie.
    if let Some(mut proc) = child.take() {
        let _ = proc.start_kill();
        let _ = proc.wait().await;
    }
}

/// Host clipboard seam used by `/actions/clipboard`.
pub trait Clipboard: Send + Sync {
    fn get_text(&self) -> Result<String>;
    fn set_text(&self, content: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_quotes() {
        assert_eq!(split_command("ls -la"), vec!["ls", "-la"]);
        assert_eq!(
            split_command(r#""/opt/some app/bin" --flag "a b""#),
            vec!["/opt/some app/bin", "--flag", "a b"]
        );
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn url_targets_have_no_working_directory() {
        assert_eq!(find_working_directory("steam://rungameid/1234"), None);
    }

    #[test]
    fn absolute_targets_resolve_to_parent() {
        assert_eq!(
            find_working_directory("/usr/bin/true --ignored"),
            Some(PathBuf::from("/usr/bin"))
        );
    }

    #[test]
    fn output_mode_parsing() {
        assert_eq!(OutputMode::from_config(""), OutputMode::Inherit);
        assert_eq!(OutputMode::from_config("null"), OutputMode::Discard);
        assert_eq!(
            OutputMode::from_config("/tmp/app.log"),
            OutputMode::Append(PathBuf::from("/tmp/app.log"))
        );
    }

    #[tokio::test]
    async fn spawns_in_own_process_group() {
        let env = HashMap::new();
        let child = run_command(false, "sleep 5", None, &env, &OutputMode::Discard).unwrap();
        let pid = child.id().unwrap();
        assert!(process_group_running(pid));

        let mut slot = Some(child);
        terminate_process_group(&mut slot, Some(pid), Duration::from_secs(1)).await;
        assert!(!process_group_running(pid));
    }

    #[tokio::test]
    async fn run_command_rejects_empty() {
        let env = HashMap::new();
        assert!(run_command(false, "", None, &env, &OutputMode::Discard).is_err());
    }
}
