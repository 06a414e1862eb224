pub mod calibration;
pub mod domain;
pub mod errors;
pub mod pipeline;
pub mod stages;
pub mod traits;
