pub mod health;
pub mod proposals;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(proposals::router())
}
