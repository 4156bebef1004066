pub mod cookies;
pub mod jwt;
pub mod security;
