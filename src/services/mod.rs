pub mod blocker;
pub mod correlator;
pub mod detector;
pub mod dispatcher;
pub mod events;
pub mod ipset;
pub mod pipeline;
pub mod reanalyzer;
pub mod sweeper;
pub mod tenants;
