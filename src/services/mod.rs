pub mod events;
pub mod executor;
pub mod init;
pub mod monitor;
pub mod notifications;
pub mod queue;
pub mod stuck;
pub mod webhooks;
pub mod worker_pool;
