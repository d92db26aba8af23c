pub mod events;
pub mod stream_id;
