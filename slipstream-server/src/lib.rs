//! Slipstream server: resolves chat events, streams upstream model output to
//! the requester and to fanout subscribers, and checkpoints partial output so
//! an interrupted stream can be replayed.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod providers;
pub mod resolver;
pub mod routes;
pub mod server;
pub mod services;
mod tracer;
