mod adapters;
mod blocks;
mod chains;
mod repos;
mod streams;

pub use adapters::*;
pub use blocks::*;
pub use chains::*;
pub use repos::*;
pub use streams::*;
