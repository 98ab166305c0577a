// Domain layer - Plain data types shared by every other layer
pub mod error;
pub mod station;
pub mod time_step;
pub mod timeseries;
