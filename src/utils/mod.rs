pub mod bitmap;
pub mod error;
pub mod info;
pub mod logger;
