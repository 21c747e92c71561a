use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::controller::{
    ErrorKind, StreamAction, StreamEvent, StreamResilienceController, StreamState,
};
use crate::error::StreamError;
use crate::sink::{RenderCommand, RenderSink};

/// Event tagged with the decoder generation that produced it
///
/// `generation == None` marks supervisor-internal events (restart timers).
#[derive(Clone, Debug)]
pub struct Envelope {
    pub generation: Option<u64>,
    pub event: StreamEvent,
}

/// Handle a decoder uses to report back to the supervisor
#[derive(Clone)]
pub struct EventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        EventSender { generation, tx }
    }

    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx
            .send(Envelope {
                generation: Some(self.generation),
                event,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The supervisor has stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One live decoder instance attached to the stream endpoint
#[async_trait]
pub trait MediaDecoder: Send {
    /// Start loading the playlist. Progress arrives as events.
    async fn attach(&mut self) -> Result<(), StreamError>;
    async fn play(&mut self) -> Result<(), StreamError>;
    /// Re-pull the playlist without rebuilding the decoder
    async fn reload_source(&mut self) -> Result<(), StreamError>;
    /// Reset decoding state in place
    async fn recover_media(&mut self) -> Result<(), StreamError>;
    /// Native-element reload
    async fn reload_element(&mut self) -> Result<(), StreamError>;
    /// Release everything; the instance is dropped right after
    async fn destroy(&mut self);
}

pub trait DecoderFactory: Send + Sync {
    fn create(&self, events: EventSender) -> Box<dyn MediaDecoder>;
}

/// Runs the controller against real decoder instances
///
/// Decoder callbacks, restart timers and shutdown all funnel through one
/// channel, so transitions happen one at a time. Events from a decoder that
/// has since been torn down carry an old generation and are dropped.
pub struct StreamSupervisor {
    controller: StreamResilienceController,
    factory: Arc<dyn DecoderFactory>,
    sink: Arc<dyn RenderSink>,
    decoder: Option<Box<dyn MediaDecoder>>,
    generation: u64,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    state_tx: watch::Sender<StreamState>,
}

impl StreamSupervisor {
    pub fn new(
        controller: StreamResilienceController,
        factory: Arc<dyn DecoderFactory>,
        sink: Arc<dyn RenderSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(controller.state());
        StreamSupervisor {
            controller,
            factory,
            sink,
            decoder: None,
            generation: 0,
            tx,
            rx,
            state_tx,
        }
    }

    /// Follow state changes from outside the supervisor task
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.dispatch(StreamEvent::Start).await;

        loop {
            tokio::select! {
                envelope = self.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if matches!(envelope.generation, Some(g) if g != self.generation) {
                        log::debug!("[STREAM] Dropping event from retired decoder: {:?}", envelope.event);
                        continue;
                    }
                    self.dispatch(envelope.event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.release().await;
        log::info!("[STREAM] Supervisor stopped");
    }

    async fn dispatch(&mut self, event: StreamEvent) {
        let actions = self.controller.handle(event);
        for action in actions {
            self.execute(action).await;
        }
        self.state_tx.send_replace(self.controller.state());
    }

    async fn execute(&mut self, action: StreamAction) {
        let result = match action {
            StreamAction::Attach => {
                self.release().await;
                self.generation += 1;
                let events = EventSender::new(self.generation, self.tx.clone());
                let mut decoder = self.factory.create(events);
                let result = decoder.attach().await;
                self.decoder = Some(decoder);
                log::info!("[STREAM] Attached decoder #{}", self.generation);
                result
            }
            StreamAction::Teardown => {
                self.release().await;
                Ok(())
            }
            StreamAction::ScheduleRestart(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = tx.send(Envelope {
                        generation: None,
                        event: StreamEvent::RestartElapsed,
                    });
                });
                Ok(())
            }
            StreamAction::HideOverlay => {
                self.sink.render(RenderCommand::FeedOverlay { visible: false });
                Ok(())
            }
            other => self.decoder_op(other).await,
        };

        if let Err(e) = result {
            // an action that cannot run is treated like a fatal decoder error
            log::warn!("[STREAM] Action failed: {}", e);
            let _ = self.tx.send(Envelope {
                generation: Some(self.generation),
                event: StreamEvent::fatal(ErrorKind::Other, e.to_string()),
            });
        }
    }

    async fn decoder_op(&mut self, action: StreamAction) -> Result<(), StreamError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(StreamError::NotAttached);
        };
        match action {
            StreamAction::Play => decoder.play().await,
            StreamAction::ReloadSource => decoder.reload_source().await,
            StreamAction::RecoverMedia => decoder.recover_media().await,
            StreamAction::ReloadElement => decoder.reload_element().await,
            _ => Ok(()),
        }
    }

    async fn release(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            decoder.destroy().await;
            log::info!("[STREAM] Released decoder #{}", self.generation);
        }
    }
}
