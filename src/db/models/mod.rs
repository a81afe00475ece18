//! Data types shared by the service layer and the queue storage.

pub mod channel_type;
pub mod notification;
pub mod queue_message;

pub use self::channel_type::*;
pub use self::notification::*;
pub use self::queue_message::*;
