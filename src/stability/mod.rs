pub mod filter;
pub mod gate;
pub mod tracker;
pub mod types;
