//! HTTP request layer.
//!
//! Thin axum handlers over [`crate::service::MusicFinder`]. Failures are
//! mapped to status codes in [`error`] and always carry a JSON body.

pub mod error;
pub mod handlers;
pub mod routes;

pub use routes::create_router;
