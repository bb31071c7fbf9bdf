pub mod config;
pub mod db;
pub mod dispatcher;
pub mod follow_graph;
pub mod jetstream;
pub mod main_stream;
pub mod resolver;
pub mod status;
pub mod temp_streams;
pub mod types;

use std::sync::atomic::AtomicBool;

/// Process-wide shutdown flag, set by the signal handler in main.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);
