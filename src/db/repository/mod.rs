pub mod dead_letter_repository;
pub mod event_repository;
pub mod snapshot_repository;
pub mod task_repository;
pub mod webhook_repository;

pub use dead_letter_repository::DeadLetterRepository;
pub use event_repository::EventRepository;
pub use snapshot_repository::SnapshotRepository;
pub use task_repository::{HeartbeatOutcome, PriorityCount, QueueStats, StatusCount, TaskRepository};
pub use webhook_repository::WebhookRepository;
