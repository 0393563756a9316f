pub mod checker;
pub mod descriptor;
