pub mod host_id;
pub mod time;
pub mod token;
