//! Command repository and the trigger pipeline that turns descriptors into device traffic

pub mod pipeline;
pub mod repository;

pub use pipeline::Router;
pub use repository::CommandRepository;
