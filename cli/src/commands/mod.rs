pub mod copy;
pub mod extension;
pub mod stage;
