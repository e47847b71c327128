pub mod espe;
pub mod mcerd;
