use std::{io::Write, sync::Mutex};

use slog::{o, Discard, Drain};

/// Assemble a logger that writes JSON records to the given writer.
pub fn assemble_logger<W: Write + Send + 'static>(w: W) -> slog::Logger {
	slog::Logger::root(Mutex::new(slog_json::Json::default(w)).fuse(), o!())
}

/// Assemble a logger whose records drain on a background thread, so a slow
/// sink never stalls the caller. Daemons with a latency-sensitive main loop
/// want this variant.
pub fn assemble_async_logger<W: Write + Send + 'static>(w: W) -> slog::Logger {
	let drain = Mutex::new(slog_json::Json::default(w)).fuse();
	let drain = slog_async::Async::new(drain).build().fuse();
	slog::Logger::root(drain, o!())
}

/// A logger that swallows everything. Handy in tests where the protocol
/// plumbing wants a logger but nobody reads the output.
pub fn discard_logger() -> slog::Logger {
	slog::Logger::root(Discard, o!())
}
