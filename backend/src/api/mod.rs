pub mod admin;
pub mod health;
pub mod postback;
pub mod wallet;

