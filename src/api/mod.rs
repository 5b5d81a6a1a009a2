//! Status & control API
//! Read-only views over rules and deployment history, plus manual deploys

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod types;

pub use handlers::AppState;
pub use routes::create_router;
pub use types::*;
