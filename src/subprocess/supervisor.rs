use anyhow::{Context, Result};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use super::ManagedProcess;

/// Hands processes over to the supervisor
#[derive(Clone)]
pub struct Registrar {
    tx: mpsc::UnboundedSender<ManagedProcess>,
}

impl Registrar {
    pub fn register(&self, process: &ManagedProcess) {
        // Only fails once the supervisor is gone, then there is nobody left to stop it
        if self.tx.send(process.clone()).is_err() {
            debug!("Supervisor already stopped, {} not registered", process.name());
        }
    }
}

/// Background listener for SIGINT and SIGTERM.
///
/// On the first signal every registered process is interrupted and awaited,
/// one after another. Call [`Supervisor::stop`] when the session ends on its own.
pub struct Supervisor {
    registrar: Registrar,
    signalled: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Supervisor {
    pub fn start() -> Result<Self> {
        // Installed here so a signal arriving before the task first runs is not lost
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ManagedProcess>();
        let (signalled_tx, signalled) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut registered = Vec::new();

            let signal_name = loop {
                tokio::select! {
                    biased;
                    Some(process) = rx.recv() => {
                        debug!(
                            "Supervising {} ({})",
                            process.name(),
                            process.credential().describe()
                        );
                        registered.push(process);
                    }
                    _ = sigint.recv() => break "SIGINT",
                    _ = sigterm.recv() => break "SIGTERM",
                }
            };

            info!("Received {signal_name}, stopping session");
            let _ = signalled_tx.send(true);

            while let Ok(process) = rx.try_recv() {
                registered.push(process);
            }

            for process in &registered {
                let status = process.stop().await;
                debug!("{} stopped with {status:?}", process.name());
            }
        });

        Ok(Self {
            registrar: Registrar { tx },
            signalled,
            task,
        })
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    /// Resolves once a signal has been received
    pub async fn signalled(&self) {
        let mut signalled = self.signalled.clone();
        if signalled.wait_for(|signalled| *signalled).await.is_err() {
            // Task is gone without seeing a signal
            std::future::pending::<()>().await;
        }
    }

    /// Waits until every registered process has been stopped
    pub async fn join(self) -> Result<()> {
        self.task.await.context("Supervisor task failed")
    }

    /// Stops listening. Used when the session ended without a signal.
    pub fn stop(self) {
        self.task.abort();
        debug!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rustix::process::{Signal, getpid, kill_process};
    use serial_test::serial;
    use tokio::{process::Command, time::timeout};

    use super::*;
    use crate::subprocess::Credential;

    fn sleeper() -> ManagedProcess {
        let mut command = Command::new("sleep");
        command.arg("30");
        ManagedProcess::spawn(command, Credential::Orchestrator(None)).unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn signal_stops_every_registered_process() {
        let supervisor = Supervisor::start().unwrap();
        let registrar = supervisor.registrar();

        let first = sleeper();
        registrar.register(&first);
        tokio::task::yield_now().await;

        // registered after the task already started
        let second = sleeper();
        registrar.register(&second);

        kill_process(getpid(), Signal::TERM).unwrap();

        timeout(Duration::from_secs(5), supervisor.signalled())
            .await
            .unwrap();
        timeout(Duration::from_secs(5), supervisor.join())
            .await
            .unwrap()
            .unwrap();

        assert!(!first.is_running());
        assert!(!second.is_running());
    }

    #[tokio::test]
    #[serial]
    async fn stop_leaves_processes_alone() {
        let supervisor = Supervisor::start().unwrap();
        let process = sleeper();
        supervisor.registrar().register(&process);

        supervisor.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(process.is_running());
        process.stop().await;
    }

    #[tokio::test]
    #[serial]
    async fn registering_after_stop_is_harmless() {
        let supervisor = Supervisor::start().unwrap();
        let registrar = supervisor.registrar();
        supervisor.stop();
        tokio::task::yield_now().await;

        let process = sleeper();
        registrar.register(&process);
        process.stop().await;
    }
}
