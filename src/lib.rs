pub mod algorithm;
pub mod graph;
pub mod mm;
pub mod utils;
