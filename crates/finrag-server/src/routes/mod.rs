// Export route modules
pub mod health;
pub mod query;
pub mod stream;

use crate::state::AppState;
use axum::Router;

// Function to configure all routes
pub fn configure(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(query::routes(state.clone()))
        .merge(stream::routes(state))
}
