pub mod frame;
pub mod values;
