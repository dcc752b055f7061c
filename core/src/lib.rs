pub mod auth;
pub mod error;
pub mod events;
pub mod findings;
pub mod limits;
