pub mod events;
pub mod health;
pub mod metrics;
pub mod projections;
pub mod read_models;
