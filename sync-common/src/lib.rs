pub mod keys;
pub mod metrics;
pub mod pgqueue;
pub mod record;
