use super::*;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/devices/register", axum::routing::post(register_device))
        .route("/api/v1/devices", axum::routing::get(list_devices))
        .route(
            "/api/v1/devices/statistics",
            axum::routing::get(device_statistics),
        )
        .route(
            "/api/v1/devices/{device_id}",
            axum::routing::get(get_device)
                .put(update_device)
                .delete(delete_device),
        )
        .route(
            "/api/v1/devices/{device_id}/liveness",
            axum::routing::get(device_liveness),
        )
        .route(
            "/api/v1/devices/{device_id}/commands",
            axum::routing::get(list_device_commands),
        )
        .route_layer(middleware::from_fn_with_state(state, require_caller))
}
