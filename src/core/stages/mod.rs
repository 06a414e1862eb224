pub mod checking;
pub mod running;
pub mod sanitizing;
