#![forbid(unsafe_code)]

pub mod admin;
pub mod front_door;
