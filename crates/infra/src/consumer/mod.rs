//! Consumer side: bounded retry, dead-letter diversion, worker loop.

pub mod dead_letter;
pub mod retry;
pub mod worker;

pub use dead_letter::{DeadLetterRouter, DivertError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use worker::{ConsumerConfig, ConsumerHandle, ConsumerStats, ProcessingOutcome, RetryingConsumer};
