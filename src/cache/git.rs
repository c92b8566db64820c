//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for anything that talks to a remote:**
//! - `clone_repo` - needs `--depth` and `--single-branch`
//! - `fetch` / `pull` / `clean` - run inside an entry's working tree
//! - `default_branch` / `remote_branch_exists` - `ls-remote` probes
//!
//! Every subprocess runs under a wall-clock deadline; on expiry it gets
//! SIGTERM, a grace period, then SIGKILL.
//!
//! **libgit2 for local reads:**
//! - `latest_commit`, `current_branch`, `remote_url`

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use git2::Repository;
use thiserror::Error;

use crate::config::GitConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// The requested branch does not exist on the remote.
    #[error("remote branch '{0}' not found")]
    BranchNotFound(String),
    #[error("clone failed: {0}")]
    CloneError(String),
    #[error("fetch failed: {0}")]
    FetchError(String),
    #[error("pull failed: {0}")]
    PullError(String),
    #[error("clean failed: {0}")]
    CleanError(String),
    /// `ls-remote` could not reach or read the remote.
    #[error("remote query failed: {0}")]
    RemoteError(String),
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result of a fast-forward pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Files changed according to the diffstat; 0 when already up to date.
    pub files_changed: u64,
}

/// The git operations the cache depends on.
pub trait Git: Send + Sync {
    /// Shallow single-branch clone of `url` into `dest`. With `branch = None`
    /// the remote's HEAD is checked out.
    ///
    /// Fails with [`GitError::BranchNotFound`] when `branch` does not exist on
    /// the remote. A failed clone leaves no `dest` behind.
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        depth: u32,
        branch: Option<&str>,
    ) -> Result<(), GitError>;

    fn fetch(&self, repo: &Path) -> Result<(), GitError>;

    /// Fast-forward `branch` from `remote`.
    fn pull(&self, repo: &Path, remote: &str, branch: &str) -> Result<PullSummary, GitError>;

    /// Remove untracked and ignored files, except paths matching `keep`.
    fn clean(&self, repo: &Path, keep: &[&str]) -> Result<(), GitError>;

    /// Full hash of the commit at HEAD.
    fn latest_commit(&self, repo: &Path) -> Result<String, GitError>;

    /// Branch HEAD points at; `None` when detached.
    fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError>;

    fn remote_url(&self, repo: &Path, remote: &str) -> Result<Option<String>, GitError>;

    /// Branch the remote's HEAD points at, when it advertises one.
    fn default_branch(&self, url: &str) -> Result<Option<String>, GitError>;

    fn remote_branch_exists(&self, url: &str, branch: &str) -> Result<bool, GitError>;
}

/// Validate that a git ref (branch name) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{name} cannot be empty")));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!("{name} cannot contain '..'")));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!("{name} cannot start with '-'")));
    }
    if value.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{name} cannot contain null or control characters"
        )));
    }
    Ok(())
}

/// Remote URLs and remote names go on the command line as positional args.
fn validate_arg(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{name} cannot be empty")));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!("{name} cannot start with '-'")));
    }
    if value.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{name} cannot contain null or control characters"
        )));
    }
    Ok(())
}

fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::ParseError(format!("{what} path is not valid UTF-8")))
}

struct CommandOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Git CLI wrapper with security hardening and per-command deadlines.
pub struct GitCli {
    git_path: String,
    timeout: Duration,
    grace: Duration,
    max_output_bytes: usize,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(&GitConfig::default())
    }
}

impl GitCli {
    pub fn new(config: &GitConfig) -> Self {
        Self {
            git_path: "git".into(),
            timeout: Duration::from_secs(config.timeout_secs),
            grace: Duration::from_secs(config.termination_grace_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn command_in(&self, repo: &Path) -> Result<Command, GitError> {
        let mut cmd = self.command();
        cmd.arg("-C").arg(path_str(repo, "repository")?);
        Ok(cmd)
    }

    /// Run `cmd` to completion or until the deadline.
    fn run(&self, cmd: Command, label: &str) -> Result<CommandOutput, GitError> {
        run_with_deadline(cmd, label, self.timeout, self.grace, self.max_output_bytes)
    }
}

fn run_with_deadline(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
    grace: Duration,
    max_output_bytes: usize,
) -> Result<CommandOutput, GitError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = thread::spawn(move || read_capped(stdout, max_output_bytes));
    let stderr_reader = thread::spawn(move || read_capped(stderr, max_output_bytes));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                log::warn!("git {label} exceeded {timeout:?}, terminating");
                terminate(&mut child, grace);
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(GitError::Timeout {
                    command: label.to_string(),
                    timeout,
                });
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(CommandOutput {
        status,
        stdout: stdout_reader.join().unwrap_or_default(),
        stderr: stderr_reader.join().unwrap_or_default(),
    })
}

/// Drain `stream` to EOF, keeping at most `limit` bytes.
fn read_capped(stream: Option<impl Read>, limit: usize) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };

    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
fn terminate(child: &mut Child, grace: Duration) {
    // SAFETY: signalling our own child by pid has no memory safety concerns.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break,
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Whether clone stderr says the requested branch is missing on the remote.
fn is_missing_branch(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    (stderr.contains("remote branch") && stderr.contains("not found"))
        || stderr.contains("couldn't find remote ref")
}

/// Sum the `N file(s) changed` lines of a `--stat` diff summary.
fn parse_files_changed(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (count, rest) = line.split_once(' ')?;
            if rest.starts_with("file changed") || rest.starts_with("files changed") {
                count.parse::<u64>().ok()
            } else {
                None
            }
        })
        .sum()
}

/// Find `ref: refs/heads/<branch>\tHEAD` in `ls-remote --symref` output.
fn parse_symref_head(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?;
        let (target, name) = rest.trim().split_once(char::is_whitespace)?;
        if name.trim() != "HEAD" {
            return None;
        }
        target
            .strip_prefix("refs/heads/")
            .filter(|b| !b.is_empty())
            .map(str::to_string)
    })
}

impl Git for GitCli {
    fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        depth: u32,
        branch: Option<&str>,
    ) -> Result<(), GitError> {
        validate_arg(url, "url")?;
        if let Some(branch) = branch {
            validate_git_ref(branch, "branch")?;
        }

        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = path_str(dest, "destination")?;

        let mut cmd = self.command();
        cmd.arg("clone")
            .arg(format!("--depth={}", depth.max(1)))
            .arg("--single-branch");
        if let Some(branch) = branch {
            cmd.arg(format!("--branch={branch}"));
        }
        cmd.arg(url).arg(dest_str);

        let result = self.run(cmd, "clone");
        let output = match result {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => output,
            Err(err) => {
                if !dest_existed {
                    let _ = std::fs::remove_dir_all(dest);
                }
                return Err(err);
            }
        };

        if !dest_existed {
            let _ = std::fs::remove_dir_all(dest);
        }
        match branch {
            Some(branch) if is_missing_branch(&output.stderr) => {
                Err(GitError::BranchNotFound(branch.to_string()))
            }
            _ => Err(GitError::CloneError(output.stderr.trim().to_string())),
        }
    }

    fn fetch(&self, repo: &Path) -> Result<(), GitError> {
        let mut cmd = self.command_in(repo)?;
        cmd.args(["fetch", "origin"]);

        let output = self.run(cmd, "fetch")?;
        if !output.status.success() {
            return Err(GitError::FetchError(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    fn pull(&self, repo: &Path, remote: &str, branch: &str) -> Result<PullSummary, GitError> {
        validate_arg(remote, "remote")?;
        validate_git_ref(branch, "branch")?;

        let mut cmd = self.command_in(repo)?;
        cmd.args(["pull", "--ff-only", "--stat"]).arg(remote).arg(branch);

        let output = self.run(cmd, "pull")?;
        if !output.status.success() {
            return Err(GitError::PullError(output.stderr.trim().to_string()));
        }
        Ok(PullSummary {
            files_changed: parse_files_changed(&output.stdout),
        })
    }

    fn clean(&self, repo: &Path, keep: &[&str]) -> Result<(), GitError> {
        let mut cmd = self.command_in(repo)?;
        cmd.args(["clean", "-f", "-d", "-x"]);
        for pattern in keep {
            validate_arg(pattern, "exclude pattern")?;
            cmd.arg("-e").arg(pattern);
        }

        let output = self.run(cmd, "clean")?;
        if !output.status.success() {
            return Err(GitError::CleanError(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    fn latest_commit(&self, repo: &Path) -> Result<String, GitError> {
        let repo = open_repository(repo)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn current_branch(&self, repo: &Path) -> Result<Option<String>, GitError> {
        let repo = open_repository(repo)?;
        current_branch_of(&repo)
    }

    fn remote_url(&self, repo: &Path, remote: &str) -> Result<Option<String>, GitError> {
        let repo = open_repository(repo)?;
        match repo.find_remote(remote) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn default_branch(&self, url: &str) -> Result<Option<String>, GitError> {
        validate_arg(url, "url")?;

        let mut cmd = self.command();
        cmd.args(["ls-remote", "--symref"]).arg(url).arg("HEAD");

        let output = self.run(cmd, "ls-remote")?;
        if !output.status.success() {
            return Err(GitError::RemoteError(output.stderr.trim().to_string()));
        }
        Ok(parse_symref_head(&output.stdout))
    }

    fn remote_branch_exists(&self, url: &str, branch: &str) -> Result<bool, GitError> {
        validate_arg(url, "url")?;
        validate_git_ref(branch, "branch")?;

        let mut cmd = self.command();
        cmd.args(["ls-remote", "--exit-code", "--heads"])
            .arg(url)
            .arg(format!("refs/heads/{branch}"));

        let output = self.run(cmd, "ls-remote")?;
        match output.status.code() {
            Some(0) => Ok(true),
            // --exit-code reports "no matching refs" as 2
            Some(2) => Ok(false),
            _ => Err(GitError::RemoteError(output.stderr.trim().to_string())),
        }
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Branch HEAD points at, including an unborn branch; `None` when detached.
fn current_branch_of(repo: &Repository) -> Result<Option<String>, GitError> {
    match repo.head() {
        Ok(head) if head.is_branch() => Ok(head.shorthand().map(str::to_string)),
        Ok(_) => Ok(None),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
            let head = repo.find_reference("HEAD")?;
            Ok(head
                .symbolic_target()
                .and_then(|target| target.strip_prefix("refs/heads/"))
                .map(str::to_string))
        }
        Err(e) => Err(e.into()),
    }
}
