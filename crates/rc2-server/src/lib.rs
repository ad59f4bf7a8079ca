pub mod auth;
pub mod server;
pub mod ws;

pub use auth::{AuthError, LoginToken, TokenSigner};
pub use server::{AppState, router, serve};
