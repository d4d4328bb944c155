pub mod analysis;
pub mod error;
pub mod events;
pub mod products;
pub mod requests;
pub mod sessions;
