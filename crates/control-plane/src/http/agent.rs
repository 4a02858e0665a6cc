use super::*;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/devices/{device_id}/heartbeat",
            axum::routing::post(heartbeat),
        )
        .route(
            "/api/v1/commands/pull",
            axum::routing::post(pull_commands).get(stream_commands),
        )
        .route(
            "/api/v1/commands/{command_id}/result",
            axum::routing::post(report_result),
        )
        .route_layer(middleware::from_fn_with_state(state, require_device))
}
