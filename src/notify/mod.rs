pub mod bus;
pub mod ndjson;

pub use bus::{Callback, Notification, NotificationBus, SubscriptionId};

pub const REGISTRATION_CREATED: &str = "registration_created";
pub const REGISTRATION_CANCELLED: &str = "registration_cancelled";
pub const EVENT_UPDATED: &str = "event_updated";
pub const EVENT_DELETED: &str = "event_deleted";

pub const ALL_KINDS: [&str; 4] = [
    REGISTRATION_CREATED,
    REGISTRATION_CANCELLED,
    EVENT_UPDATED,
    EVENT_DELETED,
];
