pub mod db;
pub mod encoder;
pub mod memory;
