pub mod clean;
pub mod entropy;
