mod error;
mod handlers;
mod middleware;

pub use error::ApiError;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};

use crate::application::{
    context::AppContext, coordinator::RefreshCoordinator, plans::PlanQueryService,
};

#[derive(Clone)]
pub struct HttpState {
    pub plans: Arc<PlanQueryService>,
    pub coordinator: Arc<RefreshCoordinator>,
    /// Bearer token for admin routes; admin routes refuse every call when unset.
    pub admin_token: Option<Arc<str>>,
}

impl HttpState {
    pub fn new(context: &AppContext, admin_token: Option<String>) -> Self {
        Self {
            plans: Arc::clone(&context.plans),
            coordinator: Arc::clone(&context.coordinator),
            admin_token: admin_token.map(Arc::from),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    let admin = Router::new()
        .route("/api/v1/admin/refresh", post(handlers::trigger_refresh))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/plans", get(handlers::list_plans))
        .route("/api/v1/plans/{id}", get(handlers::get_plan))
        .route(
            "/api/v1/plans/{id}/joined-count/increase",
            post(handlers::increase_joined_count),
        )
        .route(
            "/api/v1/plans/{id}/joined-count/decrease",
            post(handlers::decrease_joined_count),
        )
        .route(
            "/api/v1/plans/joined-counts",
            put(handlers::set_joined_counts),
        )
        .route(
            "/api/v1/users/{user_id}/plans/available",
            get(handlers::list_available_plans),
        )
        .route(
            "/api/v1/users/{user_id}/plans/joined",
            get(handlers::list_joined_plans),
        )
        .route("/api/v1/plan-groups", get(handlers::list_plan_groups))
        .merge(admin)
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
