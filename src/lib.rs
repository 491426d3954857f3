pub mod config;
pub mod error;
pub mod executor;
pub mod line_reader;
pub mod parser;
pub mod poller;
pub mod printer_lock;
pub mod queue;
pub mod resume;
pub mod retry;
pub mod session;
pub mod spooler;
pub mod store;
pub mod transport;
pub mod types;
pub mod util;
