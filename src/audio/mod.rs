pub mod output;
pub mod resample;
pub mod segment;
