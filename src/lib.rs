#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod error;
pub mod codec;
pub mod network;
pub mod objective;
pub mod generator;
pub mod embed;
pub mod dataset;
pub mod config;
pub mod training;
