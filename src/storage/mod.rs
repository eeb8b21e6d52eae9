mod db;
pub mod mailboxes;
pub mod tickets;
pub mod timers;

pub use db::Database;
