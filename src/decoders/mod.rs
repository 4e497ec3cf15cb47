pub mod apng;
pub mod chunks;
