pub mod config;
pub mod voice;

pub use self::config::*;
pub use self::voice::*;
