use tracing::instrument;

use crate::controllers::user::CredentialStore;
use crate::core::error::Error;
use crate::types::user::Credential;
use crate::utils::auth::TokenService;

/// Resolves bearer tokens to stored credentials.
#[derive(Clone, Debug)]
pub(crate) struct Guard<S> {
    tokens: TokenService,
    credentials: S,
}

impl<S: CredentialStore> Guard<S> {
    pub(crate) fn new(tokens: TokenService, credentials: S) -> Self {
        Self {
            tokens,
            credentials,
        }
    }

    pub(crate) fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[cfg(test)]
    pub(crate) fn credentials(&self) -> &S {
        &self.credentials
    }

    /// A token that fails verification is `Unauthenticated`; a valid token
    /// whose user has since been removed is `UserNotFound`.
    #[instrument(skip_all)]
    pub(crate) async fn active_user(&self, token: &str) -> Result<Credential, Error> {
        let username = self.tokens.verify(token).map_err(|e| {
            tracing::debug!("rejected bearer token: {}", e);
            Error::Unauthenticated
        })?;

        match self.credentials.find(&username).await? {
            Some(credential) => Ok(credential),
            None => {
                tracing::warn!("token subject {} no longer exists", username);
                Err(Error::UserNotFound)
            }
        }
    }

    #[instrument(skip_all)]
    pub(crate) async fn admin_user(&self, token: &str) -> Result<Credential, Error> {
        let credential = self.active_user(token).await?;

        if !credential.is_admin {
            return Err(Error::Forbidden);
        }

        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::user::memory::MemoryCredentials;
    use chrono::Duration;

    async fn guard() -> Guard<MemoryCredentials> {
        let credentials = MemoryCredentials::default();
        credentials.create("root", "hash", true).await.unwrap();
        credentials.create("reader", "hash", false).await.unwrap();

        Guard::new(
            TokenService::new("guard-secret", Duration::minutes(30)),
            credentials,
        )
    }

    #[tokio::test]
    async fn valid_token_resolves_to_its_user() {
        let guard = guard().await;
        let token = guard.tokens().issue("reader").unwrap();

        let user = guard.active_user(&token).await.unwrap();
        assert_eq!(user.username, "reader");
        assert!(!user.is_admin);
    }

    #[tokio::test]
    async fn bad_tokens_are_unauthenticated() {
        let guard = guard().await;
        let expired = TokenService::new("guard-secret", Duration::zero())
            .issue("root")
            .unwrap();

        for token in ["garbage", expired.as_str()] {
            assert!(matches!(
                guard.active_user(token).await,
                Err(Error::Unauthenticated)
            ));
        }
    }

    #[tokio::test]
    async fn deleted_user_is_not_found() {
        let guard = guard().await;
        let token = guard.tokens().issue("reader").unwrap();

        guard.credentials().remove("reader");

        assert!(matches!(
            guard.active_user(&token).await,
            Err(Error::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn admin_check_rejects_regular_users() {
        let guard = guard().await;

        let reader = guard.tokens().issue("reader").unwrap();
        assert!(matches!(
            guard.admin_user(&reader).await,
            Err(Error::Forbidden)
        ));

        let root = guard.tokens().issue("root").unwrap();
        assert!(guard.admin_user(&root).await.unwrap().is_admin);
    }
}
