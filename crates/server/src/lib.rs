//! Serving endpoints over a [`Transport`](waypoint_transport::Transport).
//!
//! A [`Server`] registers one service instance and dispatches inbound
//! messages to handlers by endpoint. Unary handlers map a request to a
//! response; streaming handlers own a [`ServerStream`] until they return.
//! Handler failures travel back to the caller as [`HandlerError`]s.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod handler;
mod server;
mod stream;

pub use error::{Error, Result};
pub use handler::HandlerError;
pub use server::Server;
pub use stream::ServerStream;
