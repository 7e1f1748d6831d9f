pub mod schema;
pub mod tool;
