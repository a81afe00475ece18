pub mod queue_message_repository;

pub use queue_message_repository::{NewQueueMessage, QueueMessageRepository};
