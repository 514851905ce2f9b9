//! Cooperative cancellation.
//!
//! [`CancellationToken`] is handed to every abortable operation (HTTP calls,
//! step executions, timed waits) so that losing a timeout race actually stops
//! the underlying work.

mod token;

pub use token::CancellationToken;
