pub mod admin;
pub mod auth;
pub mod backup_api;
pub mod cache;
pub mod catalog;
pub mod deploy;
pub mod integrations;
pub mod middleware;
pub mod models;
pub mod teams;
pub mod train;
pub mod users;
pub mod workflow;

use axum::middleware as axum_middleware;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware). `/api/deploy/update-status`
/// is public at the router level because it authenticates with a job
/// token rather than a user token.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/api/health", get(admin::health))
        .route("/api/user/signup", post(users::signup))
        .route("/api/user/login", post(users::login))
        .route("/api/user/reset-request", post(users::reset_request))
        .route("/api/user/reset", post(users::reset))
        .route("/api/model/public-list", get(models::public_list))
        // Worker-facing, job-token authenticated in the handler.
        .route("/api/deploy/update-status", post(deploy::update_status));

    let protected = Router::new()
        // Users
        .route("/api/user/refresh", post(users::refresh))
        .route("/api/user/list", get(users::list))
        .route("/api/user/:id", delete(users::delete))
        .route("/api/user/:id/promote", post(users::promote))
        // Teams
        .route("/api/team", post(teams::create))
        .route("/api/team/list", get(teams::list))
        .route("/api/team/:id/members", post(teams::add_member))
        .route("/api/team/:id/members/:uid", delete(teams::remove_member))
        // Training
        .route("/api/train", post(train::train))
        // Models
        .route("/api/model/list", get(models::list))
        .route("/api/model/:id", get(models::get))
        .route("/api/model/:id", delete(models::delete))
        .route("/api/model/:id/permissions", get(models::permissions))
        .route("/api/model/:id/reset-status", post(models::reset_status))
        // Deployments
        .route("/api/deploy/:id", post(deploy::deploy))
        .route("/api/deploy/:id", delete(deploy::undeploy))
        .route("/api/deploy/:id/save", post(deploy::save))
        // Workflows
        .route("/api/workflow/enterprise-search", post(workflow::enterprise_search))
        // Cache proxies
        .route("/api/cache/query", get(cache::query))
        .route("/api/cache/suggestions", get(cache::suggestions))
        .route("/api/cache/insert", post(cache::insert))
        .route("/api/cache/invalidate/:id", post(cache::invalidate))
        .route("/api/cache/token/:id", get(cache::token))
        // Integrations
        .route("/api/integrations", get(integrations::list))
        .route("/api/integrations", post(integrations::upsert))
        // Dataset catalog
        .route("/api/catalog", get(catalog::list))
        .route("/api/catalog", post(catalog::register))
        // Backup
        .route("/api/backup", post(backup_api::trigger))
        // Apply user auth to all protected routes.
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    public
        .merge(protected)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::disk_guard,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state,
            middleware::request_timeout,
        ))
        .layer(axum_middleware::from_fn(middleware::correlation_id))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
