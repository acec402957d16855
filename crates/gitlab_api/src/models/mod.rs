mod event;
mod namespace;
mod pipeline;
mod project;
mod user;

pub use event::{Event, EventNote, PushData};
pub use namespace::Namespace;
pub use pipeline::{Pipeline, PIPELINE_RUNNING, PIPELINE_SUCCESS};
pub use project::Project;
pub use user::CurrentUser;
