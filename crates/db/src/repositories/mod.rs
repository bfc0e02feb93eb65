//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that accept
//! `&PgPool` as the first argument. Methods that take `&mut PgConnection`
//! instead are building blocks for callers composing a transaction.

pub mod installed_library_repo;
pub mod request_repo;
pub mod target_repo;
pub mod virtual_env_repo;

pub use installed_library_repo::InstalledLibraryRepo;
pub use request_repo::RequestRepo;
pub use target_repo::TargetRepo;
pub use virtual_env_repo::VirtualEnvRepo;
