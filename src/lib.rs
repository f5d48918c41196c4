pub mod config;
pub mod connectors;
pub mod extract;
pub mod mail;
pub mod output;
pub mod pipeline;
pub mod sink;
