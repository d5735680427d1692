pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tracing_init;

pub use broadcaster::start_broadcast_tasks;
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
