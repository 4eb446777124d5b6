pub mod plates;
pub mod validation;
