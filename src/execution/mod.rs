pub mod persistence;
pub mod scheduler;
pub mod writer;
