pub mod batch;
pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod hub;
pub mod jobs;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod webhooks;
pub mod worker;
