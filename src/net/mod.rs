pub mod handler;
pub mod messages;
pub mod peer;
pub mod peerset;
pub mod transport;
