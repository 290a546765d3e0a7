pub mod chat;
pub mod commands;
pub mod images;
pub mod media;
pub mod responses;
