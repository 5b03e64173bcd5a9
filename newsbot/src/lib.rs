// Library interface for newsbot modules
// This allows tests and other binaries to import modules

pub mod admin;
pub mod analytics;
pub mod auth;
pub mod cache;
pub mod error;
pub mod export;
pub mod llm;
pub mod news;
pub mod search;
pub mod security;
pub mod server;
pub mod sessions;
pub mod storage;
