use tracing::instrument;

use crate::controllers::user::{CredentialStore, register};
use crate::core::error::Error;
use crate::utils::password::PasswordHasher;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Bootstrap {
    Created,
    AlreadyPresent,
    /// No admin exists and no initial credential is configured.
    Skipped,
}

/// Seeds the first admin account. Safe to run on every start.
#[instrument(skip_all)]
pub(crate) async fn bootstrap_admin<S: CredentialStore>(
    store: &S,
    hasher: &PasswordHasher,
    initial: Option<(&str, &str)>,
) -> Result<Bootstrap, Error> {
    if store.has_admin().await? {
        return Ok(Bootstrap::AlreadyPresent);
    }

    let Some((username, password)) = initial else {
        tracing::warn!("no admin user exists and no initial admin is configured");
        return Ok(Bootstrap::Skipped);
    };

    match register(store, hasher, username, password, true).await {
        Ok(_) => {
            tracing::info!("created initial admin {}", username);
            Ok(Bootstrap::Created)
        }
        // Another instance got there first, or the name belongs to a regular user.
        Err(Error::DuplicateUser(_)) => {
            tracing::warn!("initial admin {} is already registered", username);
            Ok(Bootstrap::AlreadyPresent)
        }
        Err(e) => Err(e),
    }
}
