//! Plan catalog handlers.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use plancache_api_types::{ApiResponse, JoinedCountEntry, RefreshSummary, VariantQuery};
use time::format_description::well_known::Rfc3339;

use crate::application::coordinator::CompletedRefresh;
use crate::application::plans::JoinedCountDelta;
use crate::domain::entities::{PlanGroup, PlanVariant, PlanView};

use super::HttpState;
use super::error::ApiError;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn variant(query: Result<Query<VariantQuery>, QueryRejection>) -> Result<PlanVariant, ApiError> {
    let Query(query) = query.map_err(|err| ApiError::bad_request(err.body_text()))?;
    Ok(query.variant.unwrap_or_default())
}

pub async fn list_plans(
    State(state): State<HttpState>,
    query: Result<Query<VariantQuery>, QueryRejection>,
) -> ApiResult<Vec<PlanView>> {
    let plans = state.plans.list_all_plans(variant(query)?).await?;
    Ok(Json(ApiResponse::ok(plans)))
}

pub async fn get_plan(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    query: Result<Query<VariantQuery>, QueryRejection>,
) -> ApiResult<PlanView> {
    let plan = state.plans.get_plan(&id, variant(query)?).await?;
    Ok(Json(ApiResponse::ok(plan)))
}

pub async fn list_available_plans(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
    query: Result<Query<VariantQuery>, QueryRejection>,
) -> ApiResult<Vec<PlanView>> {
    let plans = state
        .plans
        .list_available_plans(&user_id, variant(query)?)
        .await?;
    Ok(Json(ApiResponse::ok(plans)))
}

pub async fn list_joined_plans(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
    query: Result<Query<VariantQuery>, QueryRejection>,
) -> ApiResult<Vec<PlanView>> {
    let plans = state
        .plans
        .list_joined_plans(&user_id, variant(query)?)
        .await?;
    Ok(Json(ApiResponse::ok(plans)))
}

pub async fn list_plan_groups(State(state): State<HttpState>) -> ApiResult<Vec<PlanGroup>> {
    let groups = state.plans.list_all_plan_groups().await?;
    Ok(Json(ApiResponse::ok(groups)))
}

pub async fn increase_joined_count(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<i64> {
    let count = state
        .plans
        .adjust_joined_count(&id, JoinedCountDelta::Increase)
        .await?;
    Ok(Json(ApiResponse::ok(count)))
}

pub async fn decrease_joined_count(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> ApiResult<i64> {
    let count = state
        .plans
        .adjust_joined_count(&id, JoinedCountDelta::Decrease)
        .await?;
    Ok(Json(ApiResponse::ok(count)))
}

pub async fn set_joined_counts(
    State(state): State<HttpState>,
    payload: Result<Json<Vec<JoinedCountEntry>>, JsonRejection>,
) -> ApiResult<usize> {
    let Json(entries) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let counts: Vec<(String, i64)> = entries
        .into_iter()
        .map(|JoinedCountEntry(id, count)| (id, count))
        .collect();
    let written = state.plans.set_joined_counts(&counts).await?;
    Ok(Json(ApiResponse::ok(written)))
}

pub async fn trigger_refresh(State(state): State<HttpState>) -> ApiResult<RefreshSummary> {
    let completed = state.coordinator.refresh().await?;
    Ok(Json(ApiResponse::ok(summarize(&completed))))
}

pub async fn health() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::ok("ok"))
}

fn summarize(completed: &CompletedRefresh) -> RefreshSummary {
    let report = &completed.report;
    RefreshSummary {
        tracking_id: completed.tracking_id.to_string(),
        plans: report.plans,
        rules: report.rules,
        items: report.items,
        groups: report.groups,
        pruned: report.pruned,
        elapsed_ms: report.elapsed.as_millis() as u64,
        completed_at: report
            .completed_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| report.completed_at.unix_timestamp().to_string()),
    }
}
