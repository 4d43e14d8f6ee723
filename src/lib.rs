pub mod automation;
#[cfg(feature = "browser")]
pub mod browser;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod duration;
pub mod mail;
pub mod storage;
pub mod tap;
pub mod token;
