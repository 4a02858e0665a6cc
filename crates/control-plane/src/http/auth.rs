use super::*;

pub fn router(state: AppState) -> Router<AppState> {
    let open = Router::<AppState>::new()
        .route("/api/v1/auth/sessions", axum::routing::post(login).delete(logout))
        .route(
            "/api/v1/auth/sessions/refresh",
            axum::routing::post(refresh_session),
        );

    let keys = Router::<AppState>::new()
        .route("/api/v1/auth/sessions", axum::routing::get(list_sessions))
        .route(
            "/api/v1/auth/keys",
            axum::routing::post(create_key).get(list_keys),
        )
        .route(
            "/api/v1/auth/keys/{key_id}",
            axum::routing::get(get_key)
                .put(update_key)
                .delete(delete_key),
        )
        .route_layer(middleware::from_fn_with_state(state, require_caller));

    open.merge(keys)
}
