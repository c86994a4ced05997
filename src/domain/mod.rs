pub mod codec;
pub mod entities;
pub mod error;
pub mod groups;
