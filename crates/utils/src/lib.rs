pub mod assets;
pub mod env;
pub mod process;
pub mod response;
pub mod text;
