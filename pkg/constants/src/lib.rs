//! Centralized constants for the authorization controller.
//!
//! All project-wide constant values live here: label and annotation keys
//! that form the external contract of the generated RBAC objects, recursion
//! limits, registry key prefixes and default timings.

pub mod labels;
pub mod limits;
pub mod paths;
pub mod state;
