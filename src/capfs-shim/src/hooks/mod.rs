//! The interposed entry points. Every shim follows the same shape: resolve
//! the real symbol, log the call at debug level 1, invoke the real function
//! with the caller's arguments, and only if it succeeded emit the trace
//! event, with errno saved and restored around the tracing work.

mod fsops;
mod open;
mod proc;
