//! Artifact storage for fetchd.
//!
//! Three concerns live here: making untrusted names and paths safe to
//! write under the storage root, expanding output templates, and deleting
//! artifacts when their retention expires.

pub mod manager;
pub mod reaper;
pub mod sanitize;
pub mod template;

pub use manager::FileManager;
pub use reaper::{DeletionScheduler, DeletionTaskId};
pub use sanitize::sanitize_filename;
pub use template::{DEFAULT_TEMPLATE, TemplateContext, expand_template};
