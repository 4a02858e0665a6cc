use super::*;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/commands", axum::routing::post(create_command))
        .route(
            "/api/v1/commands/{command_id}",
            axum::routing::get(get_command),
        )
        .route_layer(middleware::from_fn_with_state(state, require_caller))
}
