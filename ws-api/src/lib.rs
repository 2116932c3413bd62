pub mod api_docs;
pub mod config;
pub mod error;
pub mod provisioner;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use provisioner::{start_provisioner_task, start_reconciler_task};
pub use routes::create_app;
pub use state::AppState;
