pub mod broadcast;
pub mod cli;
pub mod config;
pub mod console;
pub mod init;
pub mod launch;
pub mod parser;
pub mod paths;
pub mod process;
pub mod sampler;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod sys;
pub mod telemetry;
