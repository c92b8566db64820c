//! Shared types for repocache

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Error type for repository URL and branch parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("repository url cannot be empty")]
    Empty,
    #[error("invalid repository url format: {0}")]
    InvalidFormat(String),
    #[error("cannot parse owner/repo from url: {0}")]
    MissingOwnerRepo(String),
    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),
}

/// How a repository is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMethod {
    Https,
    Ssh,
}

impl fmt::Display for CloneMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneMethod::Https => write!(f, "https"),
            CloneMethod::Ssh => write!(f, "ssh"),
        }
    }
}

/// Strip trailing slashes and `.git` suffixes until neither remains.
///
/// Stripping to a fixed point keeps normalization idempotent for inputs such
/// as `repo.git/` or `repo.git.git`.
pub fn normalize_url(url: &str) -> Result<String, ParseError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut normalized = trimmed;
    loop {
        let next = normalized.trim_end_matches('/');
        let next = next.strip_suffix(".git").unwrap_or(next);
        if next == normalized {
            break;
        }
        normalized = next;
    }

    if !is_http_url(normalized) && !is_ssh_url(normalized) {
        return Err(ParseError::InvalidFormat(url.to_string()));
    }

    Ok(normalized.to_string())
}

/// `http(s)://<host>...` with no whitespace and a sane first host character.
fn is_http_url(url: &str) -> bool {
    let rest = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };

    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if !c.is_whitespace() && !matches!(c, '/' | '$' | '.' | '?' | '#') => {}
        _ => return false,
    }

    !rest.chars().any(char::is_whitespace)
}

/// `git@<host>:<path>` with a non-empty host and path.
fn is_ssh_url(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("git@") else {
        return false;
    };
    let Some((host, path)) = rest.split_once(':') else {
        return false;
    };

    !host.is_empty()
        && !path.is_empty()
        && !host.chars().any(char::is_whitespace)
        && !path.chars().any(char::is_whitespace)
}

/// Extract `(owner, repo)` from the last two path segments of a canonical URL.
///
/// The owner segment must be preceded by `/` or `:` so that both
/// `https://host/owner/repo` and `git@host:owner/repo` parse.
pub fn parse_owner_repo(canonical: &str) -> Result<(String, String), ParseError> {
    let missing = || ParseError::MissingOwnerRepo(canonical.to_string());

    let (head, repo) = canonical.rsplit_once('/').ok_or_else(missing)?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);

    let split_at = head.rfind(['/', ':']).ok_or_else(missing)?;
    let owner = &head[split_at + 1..];

    if owner.is_empty() || repo.is_empty() {
        return Err(missing());
    }

    Ok((owner.to_string(), repo.to_string()))
}

/// A validated repository URL.
///
/// Keeps the caller's spelling (minus trailing slashes) for cloning, and the
/// canonical form for identity and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoUrl {
    clone_url: String,
    canonical: String,
    owner: String,
    repo: String,
}

impl RepoUrl {
    /// Parse and validate a repository URL.
    pub fn parse(url: &str) -> Result<Self, ParseError> {
        let canonical = normalize_url(url)?;
        let (owner, repo) = parse_owner_repo(&canonical)?;

        Ok(Self {
            clone_url: url.trim().trim_end_matches('/').to_string(),
            canonical,
            owner,
            repo,
        })
    }

    /// The URL handed to `git clone`.
    pub fn clone_url(&self) -> &str {
        &self.clone_url
    }

    /// The canonical URL: no trailing slash, no `.git` suffix.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// The transport implied by the URL form.
    pub fn clone_method(&self) -> CloneMethod {
        if self.canonical.starts_with("git@") {
            CloneMethod::Ssh
        } else {
            CloneMethod::Https
        }
    }
}

impl FromStr for RepoUrl {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

/// Validate a branch name before it reaches a git command line or a path.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing whitespace, null bytes or control characters
pub fn validate_branch(branch: &str) -> Result<(), ParseError> {
    let invalid = branch.is_empty()
        || branch.contains("..")
        || branch.starts_with('-')
        || branch.chars().any(|c| c.is_whitespace() || c.is_control());

    if invalid {
        return Err(ParseError::InvalidBranch(branch.to_string()));
    }
    Ok(())
}

/// Identifies one cache entry: `(owner, repo, branch)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl EntryKey {
    /// Creates a key for `branch` of the repository at `url`.
    pub fn new(url: &RepoUrl, branch: &str) -> Result<Self, ParseError> {
        validate_branch(branch)?;
        Ok(Self {
            owner: url.owner().to_string(),
            repo: url.repo().to_string(),
            branch: branch.to_string(),
        })
    }

    /// The same repository at a different branch.
    pub fn with_branch(&self, branch: &str) -> Result<Self, ParseError> {
        validate_branch(branch)?;
        Ok(Self {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            branch: branch.to_string(),
        })
    }

    /// First 8 hex characters of the SHA-1 of the raw branch name.
    pub fn branch_digest(&self) -> String {
        let digest = Sha1::digest(self.branch.as_bytes());
        hex::encode(digest)[..8].to_string()
    }

    /// Directory name: `<owner>_<repo>_<branch>_<digest>`.
    ///
    /// Characters outside `[A-Za-z0-9._-]` in the branch are replaced with `-`
    /// so `feature/x` stays a single path component; the digest is taken over
    /// the unmodified branch, which keeps `feature/x` and `feature-x` apart.
    pub fn dir_name(&self) -> String {
        let branch: String = self
            .branch
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        format!(
            "{}_{}_{}_{}",
            self.owner,
            self.repo,
            branch,
            self.branch_digest()
        )
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.branch)
    }
}
