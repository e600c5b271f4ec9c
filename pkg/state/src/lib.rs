pub mod api;
pub mod backend;
pub mod client;
pub mod error;
pub mod memory;
pub mod store;
pub mod watch;

pub use api::Api;
pub use error::ApiError;
pub use store::Store;
