//! Git command wrappers and workspace management.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  The sync engine reaches them through the
//! [`GitTool`] trait.

pub mod bare_repo;
pub mod commands;
pub mod tool;

pub use bare_repo::{configure_fetch_refspecs, init_bare_repo, list_fetch_refspecs, set_remote};
pub use commands::{git_fetch_all, git_for_each_ref, git_ls_remote_heads, PushRun};
pub use tool::{GitTool, PushMode, SystemGit};
