use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::event_types::{marks_view_dirty, should_repaint_immediately};
use super::{Envelope, Event};
use crate::logging::LogSink;
use crate::state::StateStore;
use crate::ui::{Frame, Renderer};

pub struct RenderBatcher;

impl RenderBatcher {
    /// Spawn a background task that turns bus traffic into repaints.
    ///
    /// - Events mark the view dirty; a dirty view is painted on the next frame
    ///   tick, so bursts of ticker updates cost one repaint per frame.
    /// - `Error` and `ShutdownComplete` are painted immediately.
    /// - The task ends after painting `ShutdownComplete`, or when the bus is
    ///   dropped.
    pub fn start(
        mut rx: broadcast::Receiver<Envelope>,
        store: StateStore,
        log: Arc<dyn LogSink>,
        mut renderer: Box<dyn Renderer>,
        frame_interval: Duration,
        log_lines: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(frame_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut dirty = true;
            let paint = |renderer: &mut Box<dyn Renderer>| {
                let frame = Frame {
                    state: store.snapshot(),
                    log_tail: log.tail(log_lines),
                };
                if let Err(e) = renderer.render(&frame) {
                    tracing::warn!("failed to render frame: {e}");
                }
            };

            loop {
                tokio::select! {
                    result = rx.recv() => {
                        match result {
                            Ok(envelope) => {
                                if should_repaint_immediately(&envelope.event) {
                                    paint(&mut renderer);
                                    dirty = false;
                                    if matches!(envelope.event, Event::ShutdownComplete) {
                                        break;
                                    }
                                } else if marks_view_dirty(&envelope.event) {
                                    dirty = true;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::debug!("render batcher lagged, skipped {n} events");
                                dirty = true;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                if dirty {
                                    paint(&mut renderer);
                                }
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        if dirty {
                            paint(&mut renderer);
                            dirty = false;
                        }
                    }
                }
            }
        })
    }
}
