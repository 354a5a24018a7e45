pub mod auth;
pub mod chat;

pub use auth::{AuthAdapter, DuoAuth};
pub use chat::{ChatAdapter, SlackChat};
