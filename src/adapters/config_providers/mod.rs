pub mod file;

pub use file::{FileConfigSource, StaticConfigSource};
