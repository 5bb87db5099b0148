//! V1 API handlers.

mod files;
mod sessions;

pub use files::{storage_usage, upload_file};
pub use sessions::{delete_session, init_session, invalidate_files, reset_user, stream_session};
