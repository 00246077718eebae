pub mod cli;
pub mod vision;
