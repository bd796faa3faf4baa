pub mod broadcast;
pub mod clock_sync;
pub mod drift;
pub mod engine;
pub mod local_schedule;
pub mod ports;
pub mod readiness;
pub mod registry;
pub mod scheduler;
