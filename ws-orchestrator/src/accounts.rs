//! OS accounts that own workspace homes and run workspace services.

use crate::error::{OrchestratorError, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use ws_core::command_stream::CommandOptions;
use ws_core::naming::bounded_slug;
use ws_core::run_captured;

/// Longest account name `useradd` accepts on common distributions.
pub const MAX_ACCOUNT_NAME: usize = 32;
/// Longest DNS label.
pub const MAX_SUBDOMAIN: usize = 63;

/// Host account management. Calls block and run on the blocking pool.
pub trait HostAccounts: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool>;
    /// Creates the account with `home` as its home directory.
    fn create(&self, name: &str, home: &Path) -> Result<()>;
    /// Removes the account and its home directory. Removing a missing
    /// account succeeds.
    fn remove(&self, name: &str, home: &Path) -> Result<()>;
}

/// `useradd`/`userdel` backed accounts.
pub struct SystemAccounts {
    timeout: Duration,
}

impl Default for SystemAccounts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

impl SystemAccounts {
    pub fn new() -> Self {
        Self::default()
    }
}

// useradd: username already in use
const USERADD_EXISTS: i32 = 9;
// userdel: user does not exist
const USERDEL_MISSING: i32 = 6;
// userdel: could not remove the home directory
const USERDEL_HOME: i32 = 12;

impl HostAccounts for SystemAccounts {
    #[cfg(unix)]
    fn exists(&self, name: &str) -> Result<bool> {
        nix::unistd::User::from_name(name)
            .map(|user| user.is_some())
            .map_err(|e| OrchestratorError::Account(format!("lookup of '{name}' failed: {e}")))
    }

    #[cfg(not(unix))]
    fn exists(&self, _name: &str) -> Result<bool> {
        Err(OrchestratorError::Account(
            "host accounts are only supported on unix".to_string(),
        ))
    }

    fn create(&self, name: &str, home: &Path) -> Result<()> {
        let home_arg = home.display().to_string();
        let output = run_captured(
            "useradd",
            &[
                "--create-home",
                "--home-dir",
                home_arg.as_str(),
                "--shell",
                "/bin/bash",
                "--user-group",
                name,
            ],
            &CommandOptions::with_timeout(self.timeout),
        )
        .map_err(|e| OrchestratorError::Account(e.to_string()))?;

        match output.exit_code {
            Some(0) => {
                info!(account = name, home = %home_arg, "created host account");
                Ok(())
            }
            Some(USERADD_EXISTS) => Err(OrchestratorError::ResourceConflict(format!(
                "host account '{name}' already exists"
            ))),
            code => Err(OrchestratorError::Account(format!(
                "useradd {name} exited with {code:?}: {}",
                output.tail()
            ))),
        }
    }

    fn remove(&self, name: &str, _home: &Path) -> Result<()> {
        let output = run_captured(
            "userdel",
            &["--remove", name],
            &CommandOptions::with_timeout(self.timeout),
        )
        .map_err(|e| OrchestratorError::Account(e.to_string()))?;

        match output.exit_code {
            Some(0) | Some(USERDEL_MISSING) => Ok(()),
            Some(USERDEL_HOME) => {
                warn!(account = name, "account removed but home directory was left behind");
                Ok(())
            }
            code => Err(OrchestratorError::Account(format!(
                "userdel {name} exited with {code:?}: {}",
                output.tail()
            ))),
        }
    }
}

/// Account name candidates for a workspace, most preferred first:
/// `{prefix}{tenant}_{name}`, then numbered variants, all within
/// [`MAX_ACCOUNT_NAME`].
pub fn account_candidates(prefix: &str, tenant: &str, name: &str) -> impl Iterator<Item = String> {
    let budget = MAX_ACCOUNT_NAME.saturating_sub(prefix.len());
    let mut slug = bounded_slug(&format!("{tenant} {name}"), '_', budget);
    if slug.is_empty() {
        slug = "workspace".to_string();
    }
    if prefix.is_empty() && !slug.starts_with(|c: char| c.is_ascii_lowercase()) {
        slug.insert(0, 'u');
    }
    numbered(format!("{prefix}{slug}"), '_', MAX_ACCOUNT_NAME)
}

/// Subdomain candidates, `{name}-{tenant}` then numbered variants.
pub fn subdomain_candidates(tenant: &str, name: &str) -> impl Iterator<Item = String> {
    let mut slug = bounded_slug(&format!("{name} {tenant}"), '-', MAX_SUBDOMAIN);
    if slug.is_empty() {
        slug = "workspace".to_string();
    }
    numbered(slug, '-', MAX_SUBDOMAIN)
}

fn numbered(base: String, separator: char, max_len: usize) -> impl Iterator<Item = String> {
    (1u32..).map(move |n| {
        if n == 1 {
            return base.clone();
        }
        let suffix = format!("{separator}{n}");
        let mut stem = base.clone();
        stem.truncate(max_len.saturating_sub(suffix.len()));
        while stem.ends_with(separator) {
            stem.pop();
        }
        stem + &suffix
    })
}

/// Gives `path` to `os_user` when running as root and the account exists;
/// a no-op otherwise.
#[cfg(unix)]
pub fn hand_over(path: &Path, os_user: &str) -> Result<()> {
    use nix::unistd::{chown, geteuid, User};

    if !geteuid().is_root() {
        return Ok(());
    }
    let Some(user) = User::from_name(os_user)
        .map_err(|e| OrchestratorError::Account(format!("lookup of '{os_user}' failed: {e}")))?
    else {
        warn!(account = os_user, path = %path.display(), "no such host account, leaving ownership unchanged");
        return Ok(());
    };
    chown(path, Some(user.uid), Some(user.gid)).map_err(|e| {
        OrchestratorError::Account(format!("chown {} to {os_user}: {e}", path.display()))
    })
}

#[cfg(not(unix))]
pub fn hand_over(_path: &Path, _os_user: &str) -> Result<()> {
    Ok(())
}

/// Whether the engine can manage accounts and run commands as them.
#[cfg(unix)]
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}
