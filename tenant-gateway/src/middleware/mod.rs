pub mod auth;

pub use auth::{authentication_middleware, MaybeIdentity};
