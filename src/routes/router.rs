use crate::core::error;
use crate::core::state::AppState;
use crate::routes::{auth, table};
use crate::utils;
use axum::error_handling::HandleErrorLayer;
use axum::{
    Router,
    extract::{MatchedPath, Request},
    middleware,
    routing::{delete, get, post},
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info_span;

pub(crate) fn routes(state: AppState, rate_limit_per_second: u64) -> Router {
    let admin_routes = Router::new()
        .route("/register-api-user", post(auth::register_api_user))
        .route("/create-database", post(table::create_database))
        .route("/create-db-user", post(table::create_db_user))
        .route("/create-table", post(table::create_table))
        .route("/insert-data", post(table::insert_data))
        .route(
            "/delete-table/{db_name}/{table_name}",
            delete(table::delete_table),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            utils::auth::admin_user,
        ));

    let user_routes = Router::new()
        .route("/get-table/{db_name}/{table_name}", get(table::get_table))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            utils::auth::active_user,
        ));

    Router::new()
        .route("/", get(|| async { "tablegate is running" }))
        .route("/get-token", post(auth::get_token))
        .merge(admin_routes)
        .merge(user_routes)
        .with_state(state)
        .route_layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                        let matched_path = request
                            .extensions()
                            .get::<MatchedPath>()
                            .map(MatchedPath::as_str);

                        info_span!(
                            "request",
                            method = ?request.method(),
                            matched_path,
                        )
                    }),
                )
                .layer(HandleErrorLayer::new(error::handle_middleware_errors))
                .buffer(128)
                .rate_limit(rate_limit_per_second, Duration::from_secs(1)),
        )
}
