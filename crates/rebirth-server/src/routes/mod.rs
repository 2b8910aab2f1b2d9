pub mod chronicle;
pub mod health;
pub mod saves;
pub mod story;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Assemble the full application router: JSON API under `/api`, health at
/// the root, and the two static image mounts (generated before library, the
/// more specific prefix must win).
pub fn configure(state: AppState) -> Router {
    let api = Router::new()
        .merge(story::routes())
        .merge(chronicle::routes())
        .merge(saves::routes());

    Router::new()
        .nest("/api", api)
        .merge(health::routes())
        .nest_service(
            "/static/generated",
            ServeDir::new(&state.settings.generated_image_dir),
        )
        .nest_service("/static", ServeDir::new(&state.settings.image_library_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
