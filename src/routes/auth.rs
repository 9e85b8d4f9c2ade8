use axum::extract::{Extension, Form, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::instrument;

use crate::controllers::user::{authenticate, register};
use crate::core::error::Error;
use crate::core::state::AppState;
use crate::types::user::Credential;
use crate::types::{request, response};

#[instrument(skip_all, fields(username = %login.username))]
pub(crate) async fn get_token(
    State(state): State<AppState>,
    Form(login): Form<request::LoginData>,
) -> Result<Json<response::Token>, Error> {
    let credential = authenticate(&state.users, &state.hasher, &login.username, &login.password)
        .await?;

    let token = state.tokens().issue(&credential.username)?;

    Ok(Json(response::Token::bearer(token)))
}

#[instrument(skip_all, fields(admin = %admin.username, username = %user.username))]
pub(crate) async fn register_api_user(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Json(user): Json<request::RegisterUser>,
) -> Result<impl IntoResponse, Error> {
    let credential = register(
        &state.users,
        &state.hasher,
        &user.username,
        &user.password,
        user.is_admin,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(response::Message::new(format!(
            "API user {} registered",
            credential.username
        ))),
    ))
}
