pub mod config;
pub mod error;
pub mod fetch;
pub mod input;
pub mod metrics;
pub mod model;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod realtime;
pub mod reference;
pub mod schedule;
pub mod service_date;
pub mod stats;
pub mod validate;
