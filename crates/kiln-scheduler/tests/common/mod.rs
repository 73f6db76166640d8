//! Scripted job dispatcher shared by the scheduler tests.

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_core::job::Job;
use kiln_core::ports::{self, JobContext, JobDispatcher};
use kiln_core::run::{FailureReason, JobOutcome};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(FailureReason),
    /// Sleep, then succeed unless cancelled first.
    Sleep(Duration),
    /// Sleep without looking at the cancel flag.
    Stubborn(Duration),
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Finished(String),
}

#[derive(Default)]
pub struct FakeDispatcher {
    behaviors: HashMap<String, Behavior>,
    default_delay: Duration,
    events: Mutex<Vec<Event>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(job.to_string(), behavior);
        self
    }

    /// Delay applied to jobs without an explicit behavior.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Started(name) => Some(name),
                Event::Finished(_) => None,
            })
            .collect()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl JobDispatcher for FakeDispatcher {
    async fn dispatch(&self, job: std::sync::Arc<Job>, mut ctx: JobContext) -> JobOutcome {
        let name = job.name.to_string();
        self.record(Event::Started(name.clone()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&name)
            .cloned()
            .unwrap_or(Behavior::Sleep(self.default_delay));
        let outcome = match behavior {
            Behavior::Succeed => JobOutcome::succeeded(vec![], vec![], 0),
            Behavior::Fail(reason) => JobOutcome::failed(reason, format!("{name} failed")),
            Behavior::Sleep(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => JobOutcome::succeeded(vec![], vec![], 0),
                    _ = ports::cancelled(&mut ctx.cancel) => {
                        JobOutcome::failed(FailureReason::Cancelled, "cancelled")
                    }
                }
            }
            Behavior::Stubborn(delay) => {
                tokio::time::sleep(delay).await;
                JobOutcome::succeeded(vec![], vec![], 0)
            }
            Behavior::Panic => panic!("dispatcher blew up on {name}"),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.record(Event::Finished(name));
        outcome
    }
}

pub fn position(events: &[Event], event: &Event) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("missing event {event:?}"))
}
