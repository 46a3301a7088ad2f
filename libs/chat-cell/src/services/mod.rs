pub mod adapter;
pub mod chat;
pub mod controller;
pub mod identity;
pub mod redis_store;
pub mod retry;
pub mod store;
pub mod subscription;

pub use adapter::*;
pub use chat::*;
pub use controller::*;
pub use identity::*;
pub use redis_store::*;
pub use retry::*;
pub use store::*;
pub use subscription::*;
