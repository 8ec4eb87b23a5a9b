pub mod config;
pub mod demo;
pub mod print_trace;
