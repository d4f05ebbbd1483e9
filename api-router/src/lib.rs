use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use middleware_api_auth::api_auth;
use middleware_runner_auth::runner_auth;
use routes::{
    jobs::{delete_job, get_job, list_jobs, submit_job},
    liveness::live,
    readiness::ready,
    runner::{claim_job, complete_job, fail_job, report_progress},
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod middleware_runner_auth;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // Client endpoints (require a user API key)
    let client = Router::new()
        .route(
            "/jobs",
            // The body limit wraps only the upload handler; `get` is added
            // after the layer so listing is not affected.
            post(submit_job)
                .layer(DefaultBodyLimit::max(
                    app_state.config.upload_max_body_bytes,
                ))
                .get(list_jobs),
        )
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route_layer(from_fn_with_state(app_state.clone(), api_auth));

    // Runner endpoints (require the shared runner token)
    let runner = Router::new()
        .route("/runner/claim", post(claim_job))
        .route("/runner/jobs/{id}/progress", post(report_progress))
        .route("/runner/jobs/{id}/complete", post(complete_job))
        .route("/runner/jobs/{id}/fail", post(fail_job))
        .route_layer(from_fn_with_state(app_state.clone(), runner_auth));

    public.merge(client).merge(runner)
}
