use std::cell::RefCell;
use std::time::{Duration, Instant};

use cadvault_core::VaultError;
use git2::{
    Cred, CredentialType, ErrorCode, FetchOptions, PushOptions, RemoteCallbacks, Repository,
};
use tracing::debug;

/// Name of the shared remote in every working copy.
pub const REMOTE_NAME: &str = "origin";

/// Bound libgit2's connect and socket reads, so a remote that accepts a
/// connection and then goes silent still fails within `timeout`.
///
/// Sets process-wide libgit2 options: call once, before any thread is spawned.
#[allow(unsafe_code)]
pub fn configure_network_timeouts(timeout: Duration) -> Result<(), VaultError> {
    let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: called at startup before the runtime spawns threads, so no other
    // thread reads the options concurrently.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)
            .map_err(|e| VaultError::Internal(format!("Failed to set connect timeout: {}", e)))?;
        git2::opts::set_server_timeout_in_milliseconds(millis)
            .map_err(|e| VaultError::Internal(format!("Failed to set server timeout: {}", e)))?;
    }
    Ok(())
}

/// Network boundary of a working copy.
///
/// `RepositorySnapshot` routes every fetch and push through this trait, so
/// the only code that talks to the remote sits behind one seam.
pub trait RemoteTransport: Send + Sync {
    /// Update `refs/remotes/origin/*` from the remote.
    fn fetch(&self, repo: &Repository, branch: &str) -> Result<(), VaultError>;

    /// Push the local `branch` to the remote without forcing.
    ///
    /// A rejection because the remote moved must surface as `Conflict`.
    fn push(&self, repo: &Repository, branch: &str) -> Result<(), VaultError>;
}

/// libgit2 transport with credential negotiation and a per-operation deadline.
#[derive(Debug, Clone)]
pub struct Git2Transport {
    credential: Option<String>,
    timeout: Duration,
}

impl Git2Transport {
    pub fn new(credential: Option<String>, timeout: Duration) -> Self {
        Self {
            credential,
            timeout,
        }
    }
}

/// Credentials: configured token first, then ssh-agent, credential helper, default.
fn install_credentials(
    callbacks: &mut RemoteCallbacks<'_>,
    credential: Option<String>,
    config: Option<git2::Config>,
) {
    let mut attempts = 0u32;
    callbacks.credentials(move |url, username_from_url, allowed| {
        attempts += 1;
        if attempts > 3 {
            return Err(git2::Error::from_str("authentication failed"));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Some(token) = credential.as_deref() {
                return Cred::userpass_plaintext(username_from_url.unwrap_or("git"), token);
            }
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(user) = username_from_url {
                return Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Some(cfg) = config.as_ref() {
                if let Ok(cred) = Cred::credential_helper(cfg, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        Cred::default()
    });
}

/// Map a push failure message to the error taxonomy.
pub(crate) fn classify_push_failure(message: &str) -> VaultError {
    let msg = message.to_lowercase();
    if msg.contains("fast-forward")
        || msg.contains("fastforward")
        || msg.contains("fetch first")
        || msg.contains("stale info")
        || msg.contains("cannot lock ref")
        || msg.contains("not present locally")
    {
        VaultError::Conflict(format!("Push rejected, remote has advanced: {}", message))
    } else {
        VaultError::Sync(format!("Push failed: {}", message))
    }
}

impl RemoteTransport for Git2Transport {
    fn fetch(&self, repo: &Repository, branch: &str) -> Result<(), VaultError> {
        let mut remote = repo
            .find_remote(REMOTE_NAME)
            .map_err(|e| VaultError::Sync(format!("Remote '{}' missing: {}", REMOTE_NAME, e)))?;

        let deadline = Instant::now() + self.timeout;
        let mut callbacks = RemoteCallbacks::new();
        install_credentials(&mut callbacks, self.credential.clone(), repo.config().ok());
        callbacks.transfer_progress(move |_| Instant::now() < deadline);
        callbacks.sideband_progress(move |_| Instant::now() < deadline);

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(callbacks);

        // Glob refspec: an empty remote matches nothing instead of failing
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", REMOTE_NAME);
        remote
            .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
            .map_err(|e| {
                if Instant::now() >= deadline {
                    VaultError::Sync(format!("Fetch timed out after {:?}", self.timeout))
                } else {
                    VaultError::Sync(format!("Failed to fetch {}: {}", branch, e))
                }
            })?;

        debug!("Fetched {} from {}", branch, REMOTE_NAME);
        Ok(())
    }

    fn push(&self, repo: &Repository, branch: &str) -> Result<(), VaultError> {
        let mut remote = repo
            .find_remote(REMOTE_NAME)
            .map_err(|e| VaultError::Sync(format!("Remote '{}' missing: {}", REMOTE_NAME, e)))?;

        let deadline = Instant::now() + self.timeout;
        let rejection: RefCell<Option<String>> = RefCell::new(None);

        let result = {
            let mut callbacks = RemoteCallbacks::new();
            install_credentials(&mut callbacks, self.credential.clone(), repo.config().ok());
            callbacks.push_update_reference(|_ref_name, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            callbacks.push_negotiation(move |_| {
                if Instant::now() >= deadline {
                    Err(git2::Error::from_str("push deadline exceeded"))
                } else {
                    Ok(())
                }
            });
            callbacks.sideband_progress(move |_| Instant::now() < deadline);

            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(callbacks);

            let refspec = format!("refs/heads/{}:refs/heads/{}", branch, branch);
            remote.push(&[refspec.as_str()], Some(&mut push_options))
        };

        if let Err(e) = result {
            if Instant::now() >= deadline {
                return Err(VaultError::Sync(format!(
                    "Push timed out after {:?}",
                    self.timeout
                )));
            }
            if e.code() == ErrorCode::NotFastForward {
                return Err(VaultError::Conflict(format!(
                    "Push rejected, remote has advanced: {}",
                    e.message()
                )));
            }
            return Err(classify_push_failure(e.message()));
        }
        if let Some(msg) = rejection.into_inner() {
            return Err(classify_push_failure(&msg));
        }

        debug!("Pushed {} to {}", branch, REMOTE_NAME);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_push_failure() {
        assert!(matches!(
            classify_push_failure("cannot push non-fastforwardable reference"),
            VaultError::Conflict(_)
        ));
        assert!(matches!(
            classify_push_failure("rejected: fetch first"),
            VaultError::Conflict(_)
        ));
        assert!(matches!(
            classify_push_failure(
                "cannot push because a reference that you are trying to update on the remote \
                 contains commits that are not present locally."
            ),
            VaultError::Conflict(_)
        ));
        assert!(matches!(
            classify_push_failure("pre-receive hook declined"),
            VaultError::Sync(_)
        ));
    }
}
