use std::sync::LazyLock;

use regex::Regex;
use sqlx::Row;
use sqlx::postgres::PgRow;
use tracing::instrument;

use crate::core::error::Error;
use crate::core::store::{Store, retry_once};
use crate::types::user::Credential;
use crate::utils::password::PasswordHasher;

static USERNAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.-]{3,50}$").expect("valid username pattern"));

/// Persistent registry of API users.
pub(crate) trait CredentialStore {
    /// Fails with `DuplicateUser` if the username is taken, even under
    /// concurrent registration of the same name.
    async fn create(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<Credential, Error>;

    async fn find(&self, username: &str) -> Result<Option<Credential>, Error>;

    async fn has_admin(&self) -> Result<bool, Error>;
}

/// Checks a username/password pair. Unknown users and wrong passwords fail
/// the same way and take about as long.
#[instrument(skip(store, hasher, plaintext))]
pub(crate) async fn authenticate<S: CredentialStore>(
    store: &S,
    hasher: &PasswordHasher,
    username: &str,
    plaintext: &str,
) -> Result<Credential, Error> {
    let Some(credential) = store.find(username).await? else {
        hasher.verify_decoy(plaintext.to_owned()).await?;
        return Err(Error::InvalidCredentials);
    };

    match hasher
        .verify_async(plaintext.to_owned(), credential.password_hash.clone())
        .await?
    {
        true => Ok(credential),
        false => Err(Error::InvalidCredentials),
    }
}

/// Validates and hashes a new credential before storing it.
#[instrument(skip(store, hasher, password))]
pub(crate) async fn register<S: CredentialStore>(
    store: &S,
    hasher: &PasswordHasher,
    username: &str,
    password: &str,
    is_admin: bool,
) -> Result<Credential, Error> {
    if !USERNAME_PATTERN.is_match(username) {
        return Err(Error::InvalidUsername);
    }

    if password.is_empty() {
        return Err(Error::InvalidPassword("Password must not be empty".to_owned()));
    }

    let password_hash = hasher.hash_async(password.to_owned()).await?;
    let credential = store.create(username, &password_hash, is_admin).await?;

    tracing::info!(is_admin, "registered API user {}", credential.username);

    Ok(credential)
}

#[derive(Clone, Debug)]
pub(crate) struct UserController {
    store: Store,
}

impl UserController {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }
}

impl CredentialStore for UserController {
    async fn create(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<Credential, Error> {
        let mut session = self.store.session().await?;

        match session
            .fetch_one(
                sqlx::query(
                    "INSERT INTO api_users (username, password_hash, is_admin) VALUES ($1, $2, $3)
                    RETURNING id, username, password_hash, is_admin;",
                )
                .bind(username)
                .bind(password_hash)
                .bind(is_admin),
            )
            .await
        {
            Ok(row) => Ok(map_credential(row)),
            Err(Error::Sql(sqlx::Error::Database(db_err))) if db_err.is_unique_violation() => {
                Err(Error::DuplicateUser(username.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    async fn find(&self, username: &str) -> Result<Option<Credential>, Error> {
        let store = &self.store;

        retry_once(move || async move {
            let mut session = store.session().await?;

            let row = session
                .fetch_optional(
                    sqlx::query(
                        "SELECT id, username, password_hash, is_admin
                        FROM api_users
                        WHERE username = $1;",
                    )
                    .bind(username),
                )
                .await?;

            Ok(row.map(map_credential))
        })
        .await
    }

    async fn has_admin(&self) -> Result<bool, Error> {
        let mut session = self.store.session().await?;

        let row = session
            .fetch_one(sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM api_users WHERE is_admin);",
            ))
            .await?;

        Ok(row.get(0))
    }
}

fn map_credential(row: PgRow) -> Credential {
    Credential {
        id: row.get("id"),
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        is_admin: row.get("is_admin"),
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::CredentialStore;
    use crate::core::error::Error;
    use crate::types::user::Credential;

    /// Keeps credentials in a map; stands in for `api_users` in tests.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct MemoryCredentials {
        users: Arc<Mutex<HashMap<String, Credential>>>,
    }

    impl MemoryCredentials {
        pub(crate) fn remove(&self, username: &str) {
            self.users.lock().unwrap().remove(username);
        }

        pub(crate) fn len(&self) -> usize {
            self.users.lock().unwrap().len()
        }
    }

    impl CredentialStore for MemoryCredentials {
        async fn create(
            &self,
            username: &str,
            password_hash: &str,
            is_admin: bool,
        ) -> Result<Credential, Error> {
            let mut users = self.users.lock().unwrap();

            if users.contains_key(username) {
                return Err(Error::DuplicateUser(username.to_owned()));
            }

            let credential = Credential {
                id: users.len() as i32 + 1,
                username: username.to_owned(),
                password_hash: password_hash.to_owned(),
                is_admin,
            };

            users.insert(username.to_owned(), credential.clone());

            Ok(credential)
        }

        async fn find(&self, username: &str) -> Result<Option<Credential>, Error> {
            Ok(self.users.lock().unwrap().get(username).cloned())
        }

        async fn has_admin(&self) -> Result<bool, Error> {
            Ok(self.users.lock().unwrap().values().any(|user| user.is_admin))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCredentials;
    use super::*;
    use crate::core::store::tests::{live_settings, unreachable_settings};

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(4).unwrap()
    }

    #[tokio::test]
    async fn registered_user_authenticates() {
        let store = MemoryCredentials::default();
        let hasher = hasher();

        let created = register(&store, &hasher, "alice", "s3cret", false)
            .await
            .unwrap();
        assert_ne!(created.password_hash, "s3cret");

        let found = authenticate(&store, &hasher, "alice", "s3cret").await.unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_fail_alike() {
        let store = MemoryCredentials::default();
        let hasher = hasher();
        register(&store, &hasher, "alice", "s3cret", false)
            .await
            .unwrap();

        assert!(matches!(
            authenticate(&store, &hasher, "alice", "nope").await,
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&store, &hasher, "mallory", "s3cret").await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn usernames_and_passwords_are_validated() {
        let store = MemoryCredentials::default();
        let hasher = hasher();

        let too_long = "x".repeat(51);

        for username in ["ab", "has space", "semi;colon", too_long.as_str()] {
            assert!(matches!(
                register(&store, &hasher, username, "pw", false).await,
                Err(Error::InvalidUsername)
            ));
        }

        assert!(matches!(
            register(&store, &hasher, "alice", "", false).await,
            Err(Error::InvalidPassword(_))
        ));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let store = MemoryCredentials::default();
        let hasher = hasher();

        register(&store, &hasher, "alice", "one", false).await.unwrap();

        assert!(matches!(
            register(&store, &hasher, "alice", "two", true).await,
            Err(Error::DuplicateUser(name)) if name == "alice"
        ));
        assert!(authenticate(&store, &hasher, "alice", "one").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_creates_of_one_name_have_one_winner() {
        let store = MemoryCredentials::default();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create("racer", "hash", false).await })
            })
            .collect();

        let mut created = 0;
        let mut duplicates = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(Error::DuplicateUser(name)) if name == "racer" => duplicates += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert_eq!((created, duplicates), (1, 7));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn controller_does_not_touch_the_database_for_invalid_usernames() {
        let store = Store::new(unreachable_settings());
        let users = UserController::new(store.clone());

        assert!(matches!(
            register(&users, &hasher(), "x", "pw", false).await,
            Err(Error::InvalidUsername)
        ));
        assert!(!store.is_initialized());
    }

    async fn live_controller() -> UserController {
        let store = Store::new(live_settings());
        sqlx::migrate!()
            .run(store.pool().await.unwrap())
            .await
            .unwrap();
        UserController::new(store)
    }

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}",
            prefix,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn concurrent_registration_has_one_winner_in_postgres() {
        let users = live_controller().await;
        let username = unique_name("racer");

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let users = users.clone();
                let username = username.clone();
                tokio::spawn(async move { users.create(&username, "hash", false).await })
            })
            .collect();

        let mut created = 0;
        let mut duplicates = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => created += 1,
                Err(Error::DuplicateUser(_)) => duplicates += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert_eq!((created, duplicates), (1, 7));
    }

    #[tokio::test]
    #[ignore = "needs a PostgreSQL server at TABLEGATE_TEST_DATABASE_URL"]
    async fn stored_credentials_round_trip() {
        let users = live_controller().await;
        let hasher = hasher();
        let username = unique_name("stored");

        let created = register(&users, &hasher, &username, "pw", true)
            .await
            .unwrap();

        assert_eq!(users.find(&username).await.unwrap(), Some(created));
        assert!(users.has_admin().await.unwrap());
        assert_eq!(users.find("no_such_user_here").await.unwrap(), None);
        assert!(authenticate(&users, &hasher, &username, "pw").await.is_ok());
    }
}
