pub mod dispatch;
pub mod emergency;
pub mod expiry;
pub mod fare;
pub mod location;
pub mod ranking;
pub mod surge;
