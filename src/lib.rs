// Library crate for integration tests.
// main.rs uses these modules through the crate name.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod fake;
pub mod fetcher;
pub mod patcher;
pub mod poll_loop;
pub mod report;
pub mod routes;
pub mod server;
pub mod settings;
pub mod state;
