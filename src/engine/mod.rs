pub mod error;
pub mod evaluator;
pub mod external;
pub mod operators;
pub mod progress;
pub mod supervisor;
pub mod tracker;
