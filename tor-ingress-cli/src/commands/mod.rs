pub mod control;
pub mod render;
pub mod run;
pub mod status;
