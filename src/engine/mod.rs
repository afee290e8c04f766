//! Core engine — scan → filter → execute loop.

pub mod accountant;
pub mod automation;
pub mod events;
pub mod executor;
pub mod pool;
pub mod scanner;
