//! Phase definition.

use super::task::BoxedTask;

/// A described group of tasks executed concurrently.
///
/// Phases run in order; the first failing phase stops the pipeline.
pub struct Phase<Ctx> {
    pub description: String,
    pub tasks: Vec<BoxedTask<Ctx>>,
}

impl<Ctx> Phase<Ctx> {
    pub fn new(description: impl Into<String>, tasks: Vec<BoxedTask<Ctx>>) -> Self {
        Self {
            description: description.into(),
            tasks,
        }
    }
}

impl<Ctx> std::fmt::Debug for Phase<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("description", &self.description)
            .field(
                "tasks",
                &self.tasks.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
