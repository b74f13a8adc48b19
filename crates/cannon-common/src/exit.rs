//! Exit statuses used to decide how a message is settled.
//!
//! This numeric taxonomy is a stable contract with external handlers:
//! a subprocess signals its outcome through its exit status, an HTTP
//! handler through the `response-code` field of its response body.
//! Any other integer is treated as reject-and-requeue.

/// The handler ran out of time and was cancelled.
pub const EXIT_TIMEOUT: i32 = -1;

/// The message was processed and can be acknowledged.
pub const EXIT_ACK: i32 = 0;

/// The handler failed; the message is rejected back onto the queue.
pub const EXIT_FAILED: i32 = 1;

/// Negative acknowledgement without requeue; routes to the dead-letter
/// exchange when one is configured.
pub const EXIT_NACK: i32 = 3;

/// Negative acknowledgement with requeue.
pub const EXIT_NACK_REQUEUE: i32 = 4;

/// The handler asks for the message to be retried.
pub const EXIT_RETRY: i32 = 5;
