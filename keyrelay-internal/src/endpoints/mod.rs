pub mod relay;
pub mod status;
