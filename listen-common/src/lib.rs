pub mod listen;
pub mod metrics;
pub mod retry;
pub mod store;
