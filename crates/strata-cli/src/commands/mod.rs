pub mod admin;
pub mod keys;
