//! Repository-name derivation from git URLs.

use anyhow::{bail, Result};

/// Derive the repository name from a git URL: the segment after the last
/// `/`, with a trailing `.git` stripped.
///
/// A URL without a `/`, or ending with one, carries no repository name and
/// is an error.
pub fn extract_repo_name(git_url: &str) -> Result<String> {
    let Some((_, name)) = git_url.rsplit_once('/') else {
        bail!("no repository name in git URL {git_url}");
    };
    if name.is_empty() {
        bail!("git URL {git_url} ends with '/'");
    }
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() {
        bail!("git URL {git_url} has an empty repository name");
    }
    Ok(name.to_string())
}
