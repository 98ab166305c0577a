// Application layer - Use cases and repository traits
pub mod autoprocess;
pub mod catalog;
pub mod dispatcher;
pub mod outbox;
pub mod record_store;
pub mod series_cache;
pub mod timeseries_service;
