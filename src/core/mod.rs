pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod progress;
pub mod retry;
pub mod state;
