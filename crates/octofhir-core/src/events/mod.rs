//! Resource and delivery event stream.
//!
//! ```text
//! REST write ──► ResourceEvent ──┐
//!                                ├──► EventBroadcaster ──► receivers (loggers, tests)
//! Dispatcher ──► DeliveryEvent ──┘
//! ```
//!
//! The subscription engine is invoked synchronously by the REST boundary; the
//! broadcaster only carries events for observation and never drives delivery.

pub mod broadcaster;
pub mod types;

pub use broadcaster::EventBroadcaster;
pub use types::{
    DeliveryEvent, DeliveryEventKind, ResourceEvent, ResourceEventType, SystemEvent,
};
