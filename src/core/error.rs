use axum::BoxError;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Database migration error: {0}")]
    DatabaseMigration(#[from] sqlx::migrate::MigrateError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Startup error: {0}")]
    Startup(#[from] Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unauthenticated")]
    Unauthenticated,
    #[error("Invalid token")]
    TokenInvalid,
    #[error("Token expired")]
    TokenExpired,
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("User not found")]
    UserNotFound,
    #[error("Admin access required")]
    Forbidden,
    #[error("API user \"{0}\" already registered")]
    DuplicateUser(String),
    #[error("Invalid username")]
    InvalidUsername,
    #[error("Invalid password: {0}")]
    InvalidPassword(String),
    #[error("Malformed password hash")]
    MalformedHash,
    #[error("Database \"{0}\" already exists")]
    DatabaseExists(String),
    #[error("Database \"{0}\" does not exist")]
    DatabaseNotFound(String),
    #[error("Table \"{table}\" already exists in database \"{database}\"")]
    TableExists { database: String, table: String },
    #[error("Table \"{table}\" does not exist in database \"{database}\"")]
    TableNotFound { database: String, table: String },
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid table descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("Connection pool exhausted")]
    PoolExhausted,
    #[error("Database operation timed out")]
    OperationTimeout,
    #[error("SQL error: {0}")]
    Sql(sqlx::Error),
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("Bcrypt error: {0}")]
    Bcrypt(bcrypt::BcryptError),
    #[error("Internal server error")]
    Internal,
}

impl Error {
    /// Failures that may clear up on a fresh connection.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Error::PoolExhausted | Error::OperationTimeout)
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated
            | Error::TokenInvalid
            | Error::TokenExpired
            | Error::InvalidCredentials
            | Error::UserNotFound => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::DuplicateUser(_) | Error::DatabaseExists(_) | Error::TableExists { .. } => {
                StatusCode::CONFLICT
            }
            Error::DatabaseNotFound(_) | Error::TableNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidUsername
            | Error::InvalidPassword(_)
            | Error::InvalidIdentifier(_)
            | Error::InvalidDescriptor(_)
            | Error::SchemaMismatch(_) => StatusCode::BAD_REQUEST,
            Error::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Error::OperationTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::MalformedHash
            | Error::Sql(_)
            | Error::Jwt(_)
            | Error::Bcrypt(_)
            | Error::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Error::PoolExhausted,
            e => Error::Sql(e),
        }
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(e: bcrypt::BcryptError) -> Self {
        match e {
            bcrypt::BcryptError::InvalidHash(_)
            | bcrypt::BcryptError::InvalidPrefix(_)
            | bcrypt::BcryptError::InvalidCost(_)
            | bcrypt::BcryptError::InvalidSaltLen(_)
            | bcrypt::BcryptError::InvalidBase64(_) => Error::MalformedHash,
            e => Error::Bcrypt(e),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!("{:?}", self);
        } else {
            tracing::debug!("{:?}", self);
        }

        let message = match self {
            // Which authentication check failed is never disclosed.
            Error::Unauthenticated
            | Error::TokenInvalid
            | Error::TokenExpired
            | Error::UserNotFound => {
                return (
                    status,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Could not validate credentials",
                )
                    .into_response();
            }
            Error::InvalidCredentials => {
                return (
                    status,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Invalid username or password",
                )
                    .into_response();
            }
            Error::MalformedHash | Error::Sql(_) | Error::Jwt(_) | Error::Bcrypt(_) => {
                "Internal server error".to_owned()
            }
            e => e.to_string(),
        };

        (status, message).into_response()
    }
}

pub(crate) async fn handle_middleware_errors(err: BoxError) -> (StatusCode, &'static str) {
    tracing::error!("Unhandled error: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}
