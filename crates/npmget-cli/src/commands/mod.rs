pub mod install;
pub mod version;
