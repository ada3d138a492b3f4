pub mod app;
pub mod auth;
pub mod chat;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod settings;
pub mod store;
pub mod tokenizer;
pub mod upstream;
pub mod users;
