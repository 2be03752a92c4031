//! Application services: persistence seams, the cascading store and the demo blog.

pub mod blog;
pub mod error;
pub mod repos;
pub mod store;
