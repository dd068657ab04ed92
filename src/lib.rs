pub mod command;
pub mod config;
pub mod errors;
pub mod gates;
pub mod orchestrator;
pub mod poll;
pub mod reconcile;
pub mod steps;
pub mod ui;
