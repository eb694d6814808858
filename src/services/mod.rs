pub mod chat;
pub mod realtime;
pub mod registration;
