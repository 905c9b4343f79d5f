pub mod activity;
pub mod config;
pub mod connections;
pub mod database;
pub mod engagement;
pub mod error;
pub mod identity;
pub mod model;
pub mod search;
pub mod snapshot;
pub mod stats;

pub use activity::ActivityDb;
pub use connections::ConnectionDb;
pub use engagement::EngagementDb;
pub use error::{Error, Result};
pub use identity::UserDb;
