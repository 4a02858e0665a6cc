use super::*;

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/healthz", axum::routing::get(healthz))
        .route("/metrics", axum::routing::get(metrics))
}
