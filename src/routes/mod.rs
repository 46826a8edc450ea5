pub mod devices;
pub mod dispatch;
pub mod health;
