// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Event loop infrastructure for asynchronous message processing.
//!
//! All mutation of scheduler state happens on the single consumer task of an
//! [`EventLoop`]. External threads post events through an [`EventSender`] and
//! never block on handler execution; the channel is unbounded FIFO.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::mpsc;

use crate::error::{CinderError, Result};

/// Trait defining actions to be performed in response to events in an event loop.
#[async_trait]
pub trait EventAction<E>: Send + Sync {
    /// Called when the event loop starts.
    fn on_start(&self);

    /// Called when the event loop stops.
    fn on_stop(&self);

    /// Called when an event is received. Processes the event and optionally
    /// posts follow-up events through `sender`.
    async fn on_receive(&self, event: E, sender: &EventSender<E>) -> Result<()>;

    /// Called when an error occurs during event processing.
    fn on_error(&self, error: CinderError);
}

/// A single-consumer event loop draining events onto an [`EventAction`].
pub struct EventLoop<E> {
    /// The name of this event loop for logging purposes.
    pub name: String,
    stopped: Arc<AtomicBool>,
    action: Arc<dyn EventAction<E>>,
    tx_event: Option<mpsc::UnboundedSender<E>>,
}

impl<E: Send + 'static> EventLoop<E> {
    /// Creates a new event loop with the specified name and action handler.
    pub fn new(name: impl Into<String>, action: Arc<dyn EventAction<E>>) -> Self {
        Self {
            name: name.into(),
            stopped: Arc::new(AtomicBool::new(false)),
            action,
            tx_event: None,
        }
    }

    fn run(&self, mut rx_event: mpsc::UnboundedReceiver<E>) {
        assert!(
            self.tx_event.is_some(),
            "The event sender should be initialized first!"
        );
        let sender = EventSender::new(self.tx_event.as_ref().unwrap().clone());
        let name = self.name.clone();
        let stopped = self.stopped.clone();
        let action = self.action.clone();
        tokio::spawn(async move {
            info!("Starting the event loop {name}");
            while !stopped.load(Ordering::SeqCst) {
                if let Some(event) = rx_event.recv().await {
                    if let Err(e) = action.on_receive(event, &sender).await {
                        error!("Fail to process event due to {e}");
                        action.on_error(e);
                    }
                } else {
                    info!("Event channel closed, shutting down");
                    break;
                }
            }
            info!("The event loop {name} has been stopped");
        });
    }

    /// Starts the event loop, spawning a background task to process events.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CinderError::General(format!(
                "{} has already been stopped",
                self.name
            )));
        }
        self.action.on_start();

        let (tx_event, rx_event) = mpsc::unbounded_channel::<E>();
        self.tx_event = Some(tx_event);
        self.run(rx_event);

        Ok(())
    }

    /// Stops the event loop.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.action.on_stop();
        } else {
            // Keep quiet to allow calling `stop` multiple times.
        }
    }

    /// Returns an event sender for posting events to this loop.
    pub fn get_sender(&self) -> Result<EventSender<E>> {
        Ok(EventSender {
            tx_event: self
                .tx_event
                .as_ref()
                .cloned()
                .ok_or_else(|| CinderError::General("Event sender not exist!".to_string()))?,
        })
    }
}

/// A sender handle for posting events to an event loop.
pub struct EventSender<E> {
    tx_event: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx_event: self.tx_event.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// Creates a new event sender wrapping the given channel sender.
    pub fn new(tx_event: mpsc::UnboundedSender<E>) -> Self {
        Self { tx_event }
    }

    /// Posts an event to the event loop. Never blocks the calling thread.
    pub fn post_event(&self, event: E) -> Result<()> {
        self.tx_event
            .send(event)
            .map_err(|e| CinderError::General(format!("Fail to send event due to {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventAction<usize> for Counter {
        fn on_start(&self) {}

        fn on_stop(&self) {}

        async fn on_receive(&self, event: usize, sender: &EventSender<usize>) -> Result<()> {
            self.seen.fetch_add(event, Ordering::SeqCst);
            // A handler may enqueue follow-up work without blocking.
            if event == 1 {
                sender.post_event(10)?;
            }
            Ok(())
        }

        fn on_error(&self, _error: CinderError) {}
    }

    #[tokio::test]
    async fn processes_events_in_order() -> Result<()> {
        let action = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        let mut event_loop = EventLoop::new("test", action.clone());
        event_loop.start()?;

        let sender = event_loop.get_sender()?;
        sender.post_event(1)?;
        sender.post_event(2)?;

        for _ in 0..100 {
            if action.seen.load(Ordering::SeqCst) == 13 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(action.seen.load(Ordering::SeqCst), 13);

        event_loop.stop();
        Ok(())
    }

    #[tokio::test]
    async fn start_after_stop_is_rejected() {
        let action = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        let mut event_loop = EventLoop::new("test", action);
        event_loop.start().unwrap();
        event_loop.stop();
        assert!(event_loop.start().is_err());
    }
}
