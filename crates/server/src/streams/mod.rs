mod log;

pub use log::{EventStore, StreamEventLog, DEFAULT_READ_LIMIT, MAX_READ_LIMIT};
