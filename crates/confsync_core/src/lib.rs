pub mod changes;
pub mod config;
pub mod confluence;
pub mod git;
pub mod hierarchy;
pub mod publish;
pub mod render;
pub mod sync;
