pub mod exec;
pub mod lifecycle;
pub mod logs;
pub mod machines;
pub mod project;
