use std::sync::mpsc;
use std::thread;

/// Handle to control and join a background thread (dispatcher, reclaimer).
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread. `body` receives the shutdown channel and
    /// must return soon after a message (or disconnect) arrives on it.
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(mpsc::Receiver<()>) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shutdown_rx))?;
        Ok(Self {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the thread to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
