use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// An opaque unit of work. `Ok(())` means success, any error is a failed attempt.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Work for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self)().await
    }
}

/// A named unit of work plus the names of the tasks it must run after.
///
/// Retry is applied by the runner, never by the task itself, so one task
/// definition can be driven under different policies.
#[derive(Clone)]
pub struct Task {
    name: String,
    work: Arc<dyn Work>,
    dependencies: Vec<String>,
}

impl Task {
    pub fn new<W>(name: impl Into<String>, work: W, dependencies: &[&str]) -> Self
    where
        W: Work + 'static,
    {
        Self::from_arc(
            name,
            Arc::new(work),
            dependencies.iter().map(|d| d.to_string()),
        )
    }

    pub fn from_arc(
        name: impl Into<String>,
        work: Arc<dyn Work>,
        dependencies: impl IntoIterator<Item = String>,
    ) -> Self {
        // ordered set: keep first occurrence
        let mut deps: Vec<String> = Vec::new();
        for dep in dependencies {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        Self {
            name: name.into(),
            work,
            dependencies: deps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.work.run().await
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}
