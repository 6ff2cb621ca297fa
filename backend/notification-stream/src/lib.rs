pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod stream;

pub use config::{Config, StreamSettings};
pub use error::{AppError, Result};
pub use models::Notification;
pub use stream::{DeliveryReport, NotificationStreamEvent, StreamError, StreamService};
