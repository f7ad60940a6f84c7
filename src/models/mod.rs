pub mod dep;
pub mod task;

pub use task::{NewTask, Task, TaskDetail, TaskStatus};
