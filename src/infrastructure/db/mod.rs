pub mod pool;
pub mod video;
