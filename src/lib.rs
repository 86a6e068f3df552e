pub mod audio;
pub mod chunker;
pub mod config;
pub mod error;
pub mod narrator;
pub mod pipeline;
pub mod speak;
pub mod synth;
