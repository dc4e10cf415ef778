// Portal Client - Library root

pub mod accounts;
pub mod auth;
pub mod chatbot;
pub mod config;
pub mod error;
pub mod gemini;
pub mod http_client;
pub mod interceptor;
pub mod storage;
