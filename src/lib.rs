#[macro_use]
extern crate tracing;

pub mod broker;
pub mod bus_thread;
pub mod cli;
pub mod env;
pub mod launcher;
pub mod logging;
pub mod portal;
pub mod reactor;
pub mod strategy;
pub mod supervisor;
