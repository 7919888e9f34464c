// src/lib.rs

pub mod config;
pub mod events;
pub mod logging;
pub mod rabbitmq;
pub mod shutdown;
