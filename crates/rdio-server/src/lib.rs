//! Call ingestion, delayed release and live distribution server

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

pub mod clients;
pub mod controller;
pub mod convert;
pub mod credentials;
pub mod delayer;
pub mod dispatch;
pub mod downstream;
pub mod handlers;
pub mod registry;
pub mod routes;
pub mod search;
pub mod state;

pub use clients::{Client, Clients};
pub use controller::Controller;
pub use convert::{AudioConverter, FfmpegConverter, Passthrough};
pub use delayer::Delayer;
pub use downstream::{CallRelay, HttpRelay};
pub use registry::{CallLabels, Registry};
pub use routes::build_router;
pub use state::AppState;
