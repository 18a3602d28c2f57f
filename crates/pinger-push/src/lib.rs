//! Push notification delivery: payload building, the gateway capability,
//! retrying dispatch, endpoint registration and bulk re-register fan-out.

pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod http;
pub mod memory;
pub mod payload;

pub use dispatcher::Dispatcher;
pub use error::PushError;
pub use gateway::{Attributes, PushGateway};
pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use payload::{Notification, PayloadSettings, PingerNotification};
