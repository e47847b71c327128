pub mod cancel;
pub mod config;
pub mod domain;
pub mod naming;
