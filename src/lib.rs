pub mod bsky;
pub mod config;
pub mod cursor;
pub mod db;
pub mod extract;
pub mod fanout;
pub mod model;
pub mod scheduler;
pub mod session;
