//! Domain layer public interface.
//!
//! Types here are independent of any concrete broker or wire protocol. All
//! consumers import through this module rather than the individual files.

mod message;
mod transport;

pub use message::{Address, Message, CONTENT_TYPE_JSON};
pub use transport::{
    //
    Connector,
    ConnectorPtr,
    Delivery,
    DeliveryTag,
    Link,
    LinkPtr,
    QueueOptions,
    SubscriptionHandle,
};
