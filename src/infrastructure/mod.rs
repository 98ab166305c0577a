// Infrastructure layer - External dependencies and adapters
pub mod chunked_text;
pub mod config;
pub mod http_response;
pub mod influx_store;
pub mod memory_store;
pub mod text_format;
