pub mod delegation;
pub mod instance;
pub mod org;
pub mod setup;
