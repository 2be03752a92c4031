//! Demo HTTP surface: one page of nested fragments plus write actions.

mod middleware;

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use sqlx::Error as SqlxError;
use tracing::info;

use crate::application::{
    blog::{BlogService, Seed},
    error::{AppError, ErrorReport, HttpError},
    repos::RepoError,
};
use crate::cache::FragmentCache;
use crate::infra::db::PostgresEntityStore;
use crate::presentation::{
    template::TemplateSet,
    views::{INDEX_TEMPLATE, index_context, render_page_response},
};

use middleware::trace_requests;

#[derive(Clone)]
pub struct DemoState {
    pub blog: BlogService,
    pub blog_name: Arc<str>,
    pub seed: Arc<Seed>,
    pub cache: Arc<FragmentCache>,
    pub templates: Arc<TemplateSet>,
    /// Checked by `/health` when persistence is backed by Postgres.
    pub database: Option<Arc<PostgresEntityStore>>,
}

pub fn build_router(state: DemoState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/populate", post(populate))
        .route("/update", post(update))
        .route("/delete", post(delete))
        .route("/health", get(health))
        .with_state(state)
        .layer(axum_middleware::from_fn(trace_requests))
}

async fn index(State(state): State<DemoState>) -> Response {
    let page = match state.blog.index(&state.blog_name).await {
        Ok(page) => page,
        Err(err) => return app_error_to_http("infra::http::index", err).into_response(),
    };

    let context = index_context(&state.blog_name, page.as_ref());
    render_page_response(&state.templates, &state.cache, INDEX_TEMPLATE, &context).await
}

async fn populate(State(state): State<DemoState>) -> Response {
    match state.blog.populate(&state.seed).await {
        Ok(written) => {
            info!(written, "populate requested");
            Redirect::to("/").into_response()
        }
        Err(err) => app_error_to_http("infra::http::populate", err).into_response(),
    }
}

async fn update(State(state): State<DemoState>) -> Response {
    match state.blog.update_first_post().await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(err) => app_error_to_http("infra::http::update", err).into_response(),
    }
}

async fn delete(State(state): State<DemoState>) -> Response {
    match state.blog.delete_first_post().await {
        Ok(_) => Redirect::to("/").into_response(),
        Err(err) => app_error_to_http("infra::http::delete", err).into_response(),
    }
}

async fn health(State(state): State<DemoState>) -> Response {
    match state.database.as_ref() {
        Some(database) => db_health_response(database.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

fn app_error_to_http(source: &'static str, err: AppError) -> HttpError {
    match err {
        AppError::Repo(err) => repo_error_to_http(source, err),
        other => HttpError::from_error(
            source,
            other.status_code(),
            other.presentation_message(),
            &other,
        ),
    }
}

/// Map a repository error to a consistent HTTP error response.
pub fn repo_error_to_http(source: &'static str, err: RepoError) -> HttpError {
    match err {
        RepoError::NotFound => HttpError::new(
            source,
            StatusCode::NOT_FOUND,
            "Resource not found",
            "resource not found",
        ),
        RepoError::InvalidInput { message } => {
            HttpError::new(source, StatusCode::BAD_REQUEST, "Invalid input", message)
        }
        RepoError::Integrity { message } => HttpError::new(
            source,
            StatusCode::CONFLICT,
            "Integrity constraint violated",
            message,
        ),
        RepoError::Timeout => HttpError::new(
            source,
            StatusCode::SERVICE_UNAVAILABLE,
            "Database timeout",
            "Database timeout",
        ),
        RepoError::Persistence(message) => HttpError::new(
            source,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Persistence error",
            message,
        ),
    }
}
