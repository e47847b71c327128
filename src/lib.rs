pub mod analysis;
pub mod core;
pub mod engine;
pub mod interface;
pub mod solvers;
