pub mod clock;
pub mod config;
pub mod meter;
pub mod modbus;
pub mod probe;
pub mod pvoutput;
pub mod scheduler;
