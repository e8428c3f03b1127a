pub mod provisioner;
pub mod task_source;

pub use provisioner::*;
pub use task_source::*;
