//! Background services.

pub mod purger;

pub use purger::CvrPurger;
