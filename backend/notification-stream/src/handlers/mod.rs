/// HTTP handlers for the notification stream API
pub mod stream;

pub use stream::register_routes as register_stream;
