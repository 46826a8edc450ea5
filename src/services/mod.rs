pub mod dispatch;
pub mod executor;
pub mod fcm;
pub mod format;
pub mod init;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod signature;
pub mod stats;
pub mod worker;
