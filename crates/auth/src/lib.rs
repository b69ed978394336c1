pub mod config;
pub mod cookies;
pub mod data_model;
pub mod handlers;
pub mod oauth_state_db;
pub mod pages;
pub mod provider_client;
pub mod server;
pub mod server_state;
pub mod session_codec;
