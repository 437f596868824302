//! Built-in job bodies for workers declared in the config file.

use std::time::Duration;

use cadence_core::{TaskSettings, WorkerSettings};
use cadence_scheduler::WorkerSpec;

/// Turn a config-declared worker into a start request with its body attached.
pub fn spec_for(settings: &WorkerSettings) -> WorkerSpec {
    let spec = WorkerSpec::from(settings);
    let name = settings.name.trim().to_string();

    match settings.task.clone() {
        TaskSettings::Noop => spec.body(|| async { Ok(()) }),
        TaskSettings::Sleep { ms } => spec.body(move || async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }),
        TaskSettings::Block { ms } => spec.blocking_body(move || {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(())
        }),
        TaskSettings::Fail { message } => spec.body(move || {
            let message = message.clone();
            let name = name.clone();
            async move { anyhow::bail!("{name}: {message}") }
        }),
    }
}
