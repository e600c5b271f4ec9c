pub mod binding;
pub mod cluster;
pub mod config;
pub mod crd;
pub mod globalrole;
pub mod meta;
pub mod namespace;
pub mod rbac;
pub mod roletemplate;
pub mod status;
pub mod validate;

pub use meta::{ObjectMeta, Resource};
