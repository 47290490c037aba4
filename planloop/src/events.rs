//! Progress events emitted while a plan or strategy runs.
//!
//! Callers either pass a [`RunObserver`] to the `execute*` entry points or
//! consume a [`stream_run`] stream, which interleaves events with the final
//! result.

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::core::types::{Action, StepExecutionResult};

/// One observable moment of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    IterationStarted { iteration: u32 },
    Thought { iteration: u32, text: String },
    ActionChosen { iteration: u32, action: Action },
    /// Partial text from a streaming model function.
    Chunk { step_number: u32, text: String },
    StepCompleted(StepExecutionResult),
    Observation { iteration: u32, text: String },
}

/// Receives run events. Both methods have no-op defaults.
pub trait RunObserver: Send {
    fn on_event(&mut self, _event: RunEvent) {}

    /// Streaming model functions are only consumed chunk by chunk when the
    /// observer asks for chunks.
    fn wants_chunks(&self) -> bool {
        false
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Keeps every event in order. Handy for callers that inspect a run after
/// the fact.
#[derive(Debug, Default, Clone)]
pub struct CollectingObserver {
    pub events: Vec<RunEvent>,
    pub chunks: bool,
}

impl CollectingObserver {
    pub fn with_chunks() -> Self {
        Self {
            events: Vec::new(),
            chunks: true,
        }
    }

    pub fn completed_steps(&self) -> Vec<&StepExecutionResult> {
        self.events
            .iter()
            .filter_map(|event| match event {
                RunEvent::StepCompleted(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}

impl RunObserver for CollectingObserver {
    fn on_event(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    fn wants_chunks(&self) -> bool {
        self.chunks
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx }
    }
}

impl RunObserver for ChannelObserver {
    fn on_event(&mut self, event: RunEvent) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.tx.send(event);
    }

    fn wants_chunks(&self) -> bool {
        true
    }
}

/// Item of a streamed run: events in emission order, then exactly one
/// `Finished` carrying the run's result.
#[derive(Debug)]
pub enum RunStreamItem<T> {
    Event(RunEvent),
    Finished(T),
}

enum Next<T> {
    Event(RunEvent),
    Done(T),
}

/// Drive `run` while yielding the events it emits.
///
/// Dropping the stream drops the run future.
pub fn stream_run<'a, T, F>(run: F) -> BoxStream<'a, RunStreamItem<T>>
where
    F: FnOnce(ChannelObserver) -> BoxFuture<'a, T> + Send + 'a,
    T: Send + 'a,
{
    async_stream::stream! {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut run = run(ChannelObserver::new(tx));
        loop {
            let next = tokio::select! {
                biased;
                Some(event) = rx.recv() => Next::Event(event),
                result = &mut run => Next::Done(result),
            };
            match next {
                Next::Event(event) => yield RunStreamItem::Event(event),
                Next::Done(result) => {
                    while let Ok(event) = rx.try_recv() {
                        yield RunStreamItem::Event(event);
                    }
                    yield RunStreamItem::Finished(result);
                    break;
                }
            }
        }
    }
    .boxed()
}
