pub mod error;
pub mod frame;
pub mod packet;
pub mod telemetry;
