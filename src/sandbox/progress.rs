//! Runs slow manager operations off the front end's thread.
//!
//! Each operation gets its own background thread that reports back over a
//! channel. The front end calls [`Bridge::poll`] on its tick; phase labels
//! are folded into a latest-phase-per-sandbox map and completions come back
//! as [`Event`]s.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

use super::manager::Manager;
use super::types::Sandbox;

/// Completion of a background operation
#[derive(Debug)]
pub enum Event {
    /// Delivered exactly once per [`Bridge::start_create`]
    Created {
        name: String,
        result: Result<Sandbox>,
    },
    Destroyed {
        name: String,
        result: Result<()>,
    },
    AllDestroyed {
        count: usize,
    },
}

enum Message {
    Phase { name: String, phase: String },
    Done(Event),
}

/// Sends the terminal `Created` event when dropped, so a create thread that
/// unwinds still reports back.
struct CompletionGuard {
    name: String,
    tx: mpsc::Sender<Message>,
    sent: bool,
}

impl CompletionGuard {
    fn new(name: String, tx: mpsc::Sender<Message>) -> Self {
        Self {
            name,
            tx,
            sent: false,
        }
    }

    fn finish(mut self, result: Result<Sandbox>) {
        self.sent = true;
        let name = std::mem::take(&mut self.name);
        let _ = self.tx.send(Message::Done(Event::Created { name, result }));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        warn!(sandbox = %self.name, "create:task ended without a result");
        let _ = self.tx.send(Message::Done(Event::Created {
            name: self.name.clone(),
            result: Err(anyhow!("creation of '{}' was interrupted", self.name)),
        }));
    }
}

pub struct Bridge {
    manager: Arc<Manager>,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    /// Most recent phase of every create still in flight
    phases: BTreeMap<String, String>,
    outstanding: usize,
}

impl Bridge {
    pub fn new(manager: Arc<Manager>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            manager,
            tx,
            rx,
            phases: BTreeMap::new(),
            outstanding: 0,
        }
    }

    #[cfg(test)]
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Create `name` in the background, then launch the agent in it
    pub fn start_create(&mut self, name: &str, task: &str) {
        let manager = Arc::clone(&self.manager);
        let tx = self.tx.clone();
        let name = name.to_string();
        let task = task.to_string();
        self.outstanding += 1;

        thread::spawn(move || {
            let guard = CompletionGuard::new(name.clone(), tx.clone());
            let progress = |phase: &str| {
                let _ = tx.send(Message::Phase {
                    name: name.clone(),
                    phase: phase.to_string(),
                });
            };

            let result = manager.create(&name, &task, &progress);
            if let Ok(sandbox) = &result {
                progress("Starting agent...");
                if let Err(e) = manager.launch_agent(sandbox) {
                    warn!(sandbox = %name, error = %e, "create:agent launch failed");
                }
            }
            guard.finish(result);
        });
    }

    /// Mark `name` stopping and destroy it in the background.
    /// Returns false if the sandbox is unknown.
    pub fn start_destroy(&mut self, name: &str) -> bool {
        if !self.manager.mark_stopping(name) {
            return false;
        }
        let manager = Arc::clone(&self.manager);
        let tx = self.tx.clone();
        let name = name.to_string();
        self.outstanding += 1;

        thread::spawn(move || {
            let result = manager.destroy(&name);
            let _ = tx.send(Message::Done(Event::Destroyed { name, result }));
        });
        true
    }

    /// Mark every sandbox stopping and destroy them all in the background.
    /// Returns how many sandboxes were known.
    pub fn start_destroy_all(&mut self) -> usize {
        let sandboxes = self.manager.list();
        for sandbox in &sandboxes {
            self.manager.mark_stopping(&sandbox.name);
        }
        let manager = Arc::clone(&self.manager);
        let tx = self.tx.clone();
        self.outstanding += 1;

        thread::spawn(move || {
            let count = manager.destroy_all();
            let _ = tx.send(Message::Done(Event::AllDestroyed { count }));
        });
        sandboxes.len()
    }

    /// Drain everything published since the last poll without blocking
    pub fn poll(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Phase { name, phase } => {
                    self.phases.insert(name, phase);
                }
                Message::Done(event) => {
                    if let Event::Created { name, .. } = &event {
                        self.phases.remove(name);
                    }
                    self.outstanding = self.outstanding.saturating_sub(1);
                    debug!(?event, "bridge:completed");
                    events.push(event);
                }
            }
        }
        events
    }

    /// Latest phase of an in-flight create
    pub fn phase(&self, name: &str) -> Option<&str> {
        self.phases.get(name).map(String::as_str)
    }

    /// Operations started but not yet reported by [`Bridge::poll`]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}
