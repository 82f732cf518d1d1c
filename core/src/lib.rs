pub mod bloom;
pub mod bridge;
pub mod cache;
pub mod configuration;
pub mod driver;
pub mod error;
pub mod net;
pub mod shutdown;
mod state;
pub mod stream;
pub mod tracker;
pub mod types;
pub mod utils;
pub mod vendor;
