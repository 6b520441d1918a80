pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod prompts;
pub mod request;
pub mod thinking;
