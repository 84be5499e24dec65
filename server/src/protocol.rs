pub mod control;
pub mod durable;
pub mod reply;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod transport;
