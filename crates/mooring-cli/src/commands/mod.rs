pub mod apply;
pub mod common;
pub mod status;
pub mod sweep;
