use anyhow::{Context, Result};
use kiln_core::{Orchestrator, TaskEvent, WatchEvent};
use tracing::{debug, error, info, instrument, warn};

/// Runs one task of the graph to completion.
#[instrument(skip(orchestrator))]
pub async fn run(orchestrator: &Orchestrator, task: &str) -> Result<()> {
    info!(target: "kiln", "run {task}");
    orchestrator
        .run(task)
        .await
        .with_context(|| format!("task '{task}' did not complete"))
}

/// Watches every watchable task until ctrl-c, then stops all watchers.
#[instrument(skip_all)]
pub async fn watch(orchestrator: &Orchestrator) -> Result<()> {
    let mut session = orchestrator
        .watch()
        .await
        .context("unable to start watching")?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("failed to listen for ctrl-c: {}", e);
                }
                info!(target: "kiln", "stopping watchers");
                break;
            }
            event = session.next_event() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    session.stop().await.context("failed to stop watchers")
}

/// Fatal events never end the session; the task retries on its next change.
fn log_event(event: &TaskEvent) {
    let task = event.task.as_str();
    match &event.event {
        WatchEvent::Start => debug!(task, "watch started"),
        WatchEvent::Compiling => debug!(task, "compiling"),
        WatchEvent::Warning(warnings) => debug!(task, count = warnings.len(), "warnings flushed"),
        WatchEvent::Success(outputs) => {
            info!(target: "kiln", task, outputs = outputs.len(), "build succeeded")
        }
        WatchEvent::Fatal(message) => error!(target: "kiln", task, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use kiln_core::{
        Backend, BuildContext, BuildOptions, BuildOutcome, Capability, ConfigFragment,
        Diagnostic, Job, Preset, ProjectConfig, RunnerTable, TaskDefinition,
    };

    #[derive(Debug)]
    struct Failing;

    impl Preset for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn capabilities(&self) -> HashSet<Capability> {
            HashSet::from([Capability::DefaultConfig, Capability::BundleCreator])
        }

        fn default_config(&self) -> ConfigFragment {
            ConfigFragment::new()
                .set("bundle_types.js", "js")
                .set("js.app.source", "js/app.js")
        }

        fn bundle_creator(&self, _ctx: &BuildContext, runners: &mut RunnerTable) {
            runners.add("js", "failing", Arc::new(Failing));
        }
    }

    impl Backend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn prepare(
            &self,
            _ctx: &BuildContext,
            _task: TaskDefinition,
        ) -> kiln_core::Result<Arc<dyn Job>> {
            Ok(Arc::new(FailingJob))
        }
    }

    #[derive(Debug)]
    struct FailingJob;

    #[async_trait]
    impl Job for FailingJob {
        async fn run(&self) -> kiln_core::Result<BuildOutcome> {
            Ok(BuildOutcome::failure(Diagnostic::error("syntax error")))
        }
    }

    #[tokio::test]
    async fn failed_task_surfaces_as_error_with_context() {
        let orchestrator = Orchestrator::new(
            vec![Arc::new(Failing)],
            Some(&ProjectConfig::default()),
            BuildOptions::default(),
        )
        .unwrap();

        let err = run(&orchestrator, "default").await.unwrap_err();
        assert_eq!(err.to_string(), "task 'default' did not complete");
        assert_eq!(
            err.root_cause().to_string(),
            "task 'js_app' failed: syntax error"
        );
    }
}
