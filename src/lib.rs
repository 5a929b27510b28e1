pub mod config;
pub mod gateway;
pub mod ipc;
pub mod sandbox;
pub mod toolchain;
