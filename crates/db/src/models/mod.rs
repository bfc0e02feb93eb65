//! Domain model structs and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` entity struct matching
//! the database row and, where rows are created by the core, a create DTO.

pub mod initialization;
pub mod installed_library;
pub mod request;
pub mod target;
pub mod virtual_env;
