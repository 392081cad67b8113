pub mod control;
pub mod events;
pub mod health;
pub mod report;
