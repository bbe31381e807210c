pub mod server;
pub mod types;

pub use server::ApiServer;
pub use types::{FeedParams, GraphParams, ReconcileRequest, SubmitContent};
