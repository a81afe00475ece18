pub mod email;
pub mod in_app;
pub mod init;
pub mod notifications;
pub mod queue;
pub mod sms;
pub mod store;
