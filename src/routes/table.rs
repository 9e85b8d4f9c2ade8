use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::instrument;

use crate::core::error::Error;
use crate::core::state::AppState;
use crate::types::user::Credential;
use crate::types::{request, response};

#[instrument(skip_all, fields(admin = %admin.username, db = %params.db_name))]
pub(crate) async fn create_database(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Json(params): Json<request::CreateDatabase>,
) -> Result<impl IntoResponse, Error> {
    state.tables.create_database(&params.db_name).await?;

    Ok((
        StatusCode::CREATED,
        Json(response::Message::new(format!(
            "Database {} created",
            params.db_name
        ))),
    ))
}

#[instrument(skip_all, fields(admin = %admin.username, db = %params.db_name, role = %params.username))]
pub(crate) async fn create_db_user(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Json(params): Json<request::CreateDbUser>,
) -> Result<impl IntoResponse, Error> {
    let created = state
        .tables
        .create_db_user(
            &params.db_name,
            &params.username,
            &params.password,
            &params.privileges,
        )
        .await?;

    let message = match created {
        true => format!(
            "User {} created with access to {}",
            params.username, params.db_name
        ),
        false => format!(
            "User {} already existed; privileges on {} granted",
            params.username, params.db_name
        ),
    };

    Ok((StatusCode::CREATED, Json(response::Message::new(message))))
}

#[instrument(skip_all, fields(admin = %admin.username, db = %params.db_name, table = %params.table_name))]
pub(crate) async fn create_table(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Json(params): Json<request::CreateTable>,
) -> Result<impl IntoResponse, Error> {
    state
        .tables
        .create_table(&params.db_name, &params.table_name, &params.table_schema)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(response::Message::new(format!(
            "Table {} created in database {}",
            params.table_name, params.db_name
        ))),
    ))
}

#[instrument(skip_all, fields(admin = %admin.username, db = %params.db_name, table = %params.table_name))]
pub(crate) async fn insert_data(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Json(params): Json<request::InsertData>,
) -> Result<impl IntoResponse, Error> {
    let summary = state
        .tables
        .insert_rows(&params.db_name, &params.table_name, &params.data)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(response::Inserted {
            message: format!(
                "Data inserted into {}.{}",
                params.db_name, params.table_name
            ),
            summary,
        }),
    ))
}

#[instrument(skip_all, fields(user = %user.username, db = %db_name, table = %table_name))]
pub(crate) async fn get_table(
    State(state): State<AppState>,
    Extension(user): Extension<Credential>,
    Path((db_name, table_name)): Path<(String, String)>,
) -> Result<Json<response::TableData>, Error> {
    let data = state.tables.fetch_table(&db_name, &table_name).await?;

    Ok(Json(response::TableData {
        db_name,
        table_name,
        data,
    }))
}

#[instrument(skip_all, fields(admin = %admin.username, db = %db_name, table = %table_name))]
pub(crate) async fn delete_table(
    State(state): State<AppState>,
    Extension(admin): Extension<Credential>,
    Path((db_name, table_name)): Path<(String, String)>,
) -> Result<Json<response::Message>, Error> {
    state.tables.delete_table(&db_name, &table_name).await?;

    Ok(Json(response::Message::new(format!(
        "Table {} deleted from database {}",
        table_name, db_name
    ))))
}
