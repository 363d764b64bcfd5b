pub mod property;
pub mod unit;
