pub mod messages;
pub mod primitives;
