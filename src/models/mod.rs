pub mod driver;
pub mod emergency;
pub mod event;
pub mod location;
pub mod request;
pub mod ride;
pub mod surge;
