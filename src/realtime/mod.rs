//! Realtime streaming voice channel.
//!
//! Bidirectional speech over one WebSocket session: microphone frames
//! stream up, assistant audio streams down as deltas that are queued
//! and played back-to-back so a response never has audible gaps. The
//! user can barge in at any time, which flushes the playback queue and
//! cancels the in-flight response server-side.
//!
//! The channel is half-duplex by policy: while the assistant is
//! speaking, microphone frames still feed the local VAD (so barge-in
//! works) but are not forwarded upstream.

pub mod protocol;
pub mod transport;

use crate::config::{RealtimeConfig, VadConfig};
use crate::error::{Result, VoiceError};
use crate::events::VoiceEvent;
use crate::realtime::protocol::{
    ClientEvent, ConversationItem, ResponseOptions, ServerEvent, SessionSettings,
};
use crate::realtime::transport::{RealtimeSession, RealtimeTransport};
use crate::synthesis::AudioSink;
use crate::vad::{EnergyVad, VadTransition};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PLAYBACK_VOLUME: f32 = 1.0;

/// Commands routed into the session actor.
enum Command {
    StartListening,
    StopListening,
    PushAudio(Vec<i16>),
    SendText(String),
    Speak(String),
    Interrupt,
}

/// Flags shared between the channel handle and its session actor.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    /// The user wants the microphone on. Actual listening is gated on
    /// not currently speaking (half-duplex).
    armed: AtomicBool,
    speaking: AtomicBool,
    /// Frames waiting for playback, excluding the one in flight.
    queued: AtomicUsize,
}

/// Streaming speech-to-speech channel.
///
/// State machine: Disconnected → Connected(Idle ⇄ Listening ⇄ Speaking)
/// → Disconnected. Listening and Speaking are mutually exclusive.
pub struct RealtimeVoiceChannel {
    config: RealtimeConfig,
    vad_config: VadConfig,
    transport: Arc<dyn RealtimeTransport>,
    sink: Arc<dyn AudioSink>,
    events: broadcast::Sender<VoiceEvent>,
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeVoiceChannel {
    /// Create a channel over the given transport and playback sink,
    /// publishing into the shared event stream.
    pub fn new(
        config: RealtimeConfig,
        vad_config: VadConfig,
        transport: Arc<dyn RealtimeTransport>,
        sink: Arc<dyn AudioSink>,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            config,
            vad_config,
            transport,
            sink,
            events,
            shared: Arc::new(Shared::default()),
            cmd_tx: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the microphone is armed and the assistant is not
    /// currently speaking over it.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.is_connected()
            && self.shared.armed.load(Ordering::SeqCst)
            && !self.shared.speaking.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    /// Frames waiting for playback (excludes the frame in flight).
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Establish the streaming session and configure it. No-op when
    /// already connected.
    ///
    /// # Errors
    ///
    /// `VoiceError::ConnectionUnavailable` when the endpoint cannot be
    /// reached; `VoiceError::Config` on bad settings. The channel stays
    /// disconnected on failure.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut session = self.transport.connect(&self.config).await?;
        session
            .send(ClientEvent::SessionUpdate {
                session: SessionSettings::voice_session(
                    &self.config.model,
                    &self.config.voice,
                    &self.config.instructions,
                ),
            })
            .await?;

        let cancel = CancellationToken::new();
        if let Ok(mut guard) = self.cancel.lock() {
            *guard = cancel.clone();
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.cmd_tx.lock() {
            *guard = Some(cmd_tx);
        }

        self.shared.connected.store(true, Ordering::SeqCst);
        info!(model = %self.config.model, "realtime session established");
        let _ = self.events.send(VoiceEvent::Connected);

        let actor = SessionActor {
            session,
            cmd_rx,
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            sink: Arc::clone(&self.sink),
            vad: EnergyVad::new(&self.vad_config),
            cancel,
            queue: VecDeque::new(),
            playing: None,
            response_active: false,
        };
        let handle = tokio::spawn(actor.run());
        if let Ok(mut guard) = self.task.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    /// Tear the session down, stopping playback and capture. Waits for
    /// the actor to finish so the speaker is silent on return.
    pub async fn disconnect(&self) {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(guard) = self.cancel.lock() {
            guard.cancel();
        }
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Ok(mut guard) = self.cmd_tx.lock() {
            *guard = None;
        }
        info!("realtime session closed");
    }

    /// Arm the microphone.
    ///
    /// # Errors
    ///
    /// `VoiceError::ConnectionUnavailable` when not connected.
    pub fn start_listening(&self) -> Result<()> {
        self.send_command(Command::StartListening)
    }

    /// Disarm the microphone. No-op when not connected.
    pub fn stop_listening(&self) {
        let _ = self.send_command(Command::StopListening);
    }

    /// Feed one microphone frame (PCM16 at the configured input rate).
    /// Frames are dropped when not connected.
    pub fn push_audio(&self, samples: &[i16]) {
        let _ = self.send_command(Command::PushAudio(samples.to_vec()));
    }

    /// Inject a typed user message and request a spoken response.
    ///
    /// # Errors
    ///
    /// `VoiceError::ConnectionUnavailable` when not connected.
    pub fn send_text_message(&self, text: &str) -> Result<()> {
        self.send_command(Command::SendText(text.to_owned()))
    }

    /// Ask the assistant to speak the given text verbatim. Supersedes
    /// any response currently playing.
    ///
    /// # Errors
    ///
    /// `VoiceError::ConnectionUnavailable` when not connected.
    pub fn speak(&self, text: &str) -> Result<()> {
        self.send_command(Command::Speak(text.to_owned()))
    }

    /// Barge in: flush queued playback and cancel the in-flight
    /// response. No-op when nothing is playing or not connected.
    pub fn interrupt(&self) {
        let _ = self.send_command(Command::Interrupt);
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let guard = self
            .cmd_tx
            .lock()
            .map_err(|_| VoiceError::Channel("realtime command lock poisoned".to_owned()))?;
        match guard.as_ref() {
            Some(tx) if self.shared.connected.load(Ordering::SeqCst) => tx
                .send(command)
                .map_err(|_| VoiceError::ConnectionUnavailable("session closed".to_owned())),
            _ => Err(VoiceError::ConnectionUnavailable(
                "realtime channel is not connected".to_owned(),
            )),
        }
    }
}

/// What woke the actor loop.
enum Wake {
    Cancelled,
    Server(Option<Result<ServerEvent>>),
    Command(Option<Command>),
    PlaybackDone(Result<()>),
}

/// Owns the session, the playback queue, and the local VAD. Single
/// task, so state transitions are serialized and event ordering is
/// deterministic.
struct SessionActor {
    session: Box<dyn RealtimeSession>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<VoiceEvent>,
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    vad: EnergyVad,
    cancel: CancellationToken,
    queue: VecDeque<Bytes>,
    /// The frame currently feeding the speaker, if any. Dropping this
    /// future aborts its playback.
    playing: Option<BoxFuture<'static, Result<()>>>,
    /// A response cycle is open server-side. Deltas outside an active
    /// response are remnants of a cancelled one and are dropped.
    response_active: bool,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            self.advance_playback();

            let wake = {
                let Self {
                    session,
                    cmd_rx,
                    playing,
                    cancel,
                    ..
                } = &mut self;
                let frame_in_flight = playing.is_some();
                tokio::select! {
                    () = cancel.cancelled() => Wake::Cancelled,
                    maybe = session.next_event() => Wake::Server(maybe),
                    maybe = cmd_rx.recv() => Wake::Command(maybe),
                    result = async {
                        match playing.as_mut() {
                            Some(frame) => frame.await,
                            None => std::future::pending().await,
                        }
                    }, if frame_in_flight => Wake::PlaybackDone(result),
                }
            };

            match wake {
                Wake::Cancelled => {
                    self.shutdown(false).await;
                    break;
                }
                Wake::Server(None) => {
                    warn!("realtime session closed by peer");
                    self.shutdown(true).await;
                    break;
                }
                Wake::Server(Some(Err(e))) => {
                    warn!("realtime receive error: {e}");
                    let _ = self.events.send(VoiceEvent::Error {
                        message: e.to_string(),
                    });
                    self.shutdown(true).await;
                    break;
                }
                Wake::Server(Some(Ok(event))) => self.handle_server_event(event).await,
                Wake::Command(None) => {
                    self.shutdown(false).await;
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::PlaybackDone(result) => {
                    self.playing = None;
                    if let Err(e) = result {
                        warn!("frame playback failed: {e}");
                        let _ = self.events.send(VoiceEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Start the next queued frame if the speaker is free; once the
    /// queue drains after the response finished, leave the Speaking
    /// state.
    fn advance_playback(&mut self) {
        if self.playing.is_some() {
            return;
        }
        if let Some(frame) = self.queue.pop_front() {
            self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
            let sink = Arc::clone(&self.sink);
            self.playing = Some(Box::pin(async move {
                sink.play(frame, PLAYBACK_VOLUME).await
            }));
        } else if !self.response_active {
            self.finish_speaking();
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated => debug!("realtime session configured"),
            ServerEvent::SpeechStarted => {
                let _ = self.events.send(VoiceEvent::SpeechActivity { active: true });
                if self.shared.speaking.load(Ordering::SeqCst) {
                    self.barge_in().await;
                }
            }
            ServerEvent::SpeechStopped => {
                let _ = self.events.send(VoiceEvent::SpeechActivity { active: false });
            }
            ServerEvent::InputTranscript { transcript } => {
                if !transcript.trim().is_empty() {
                    let _ = self.events.send(VoiceEvent::TranscriptFinal { text: transcript });
                }
            }
            ServerEvent::ResponseCreated => {
                self.response_active = true;
            }
            ServerEvent::AudioDelta { delta } => {
                if !self.response_active {
                    return;
                }
                match protocol::decode_audio(&delta) {
                    Ok(frame) => {
                        self.begin_speaking();
                        self.queue.push_back(frame);
                        self.shared.queued.store(self.queue.len(), Ordering::SeqCst);
                    }
                    Err(e) => {
                        warn!("dropping bad audio frame: {e}");
                        let _ = self.events.send(VoiceEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
            ServerEvent::ResponseTranscript { transcript } => {
                if !transcript.trim().is_empty() {
                    let _ = self
                        .events
                        .send(VoiceEvent::AssistantTranscript { text: transcript });
                }
            }
            ServerEvent::ResponseDone => {
                self.response_active = false;
                // Speaking ends once the queue drains; advance_playback
                // handles the transition at the top of the loop.
            }
            ServerEvent::Error { error } => {
                warn!("realtime server error: {}", error.message);
                let _ = self.events.send(VoiceEvent::Error {
                    message: error.message,
                });
            }
            ServerEvent::Ignored => {}
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartListening => {
                if !self.shared.armed.swap(true, Ordering::SeqCst)
                    && !self.shared.speaking.load(Ordering::SeqCst)
                {
                    let _ = self.events.send(VoiceEvent::ListeningStarted);
                }
            }
            Command::StopListening => {
                if self.shared.armed.swap(false, Ordering::SeqCst)
                    && !self.shared.speaking.load(Ordering::SeqCst)
                {
                    let _ = self.events.send(VoiceEvent::ListeningStopped);
                }
            }
            Command::PushAudio(samples) => self.handle_audio_frame(&samples).await,
            Command::SendText(text) => {
                let item = ClientEvent::CreateItem {
                    item: ConversationItem::user_text(&text),
                };
                let response = ClientEvent::CreateResponse {
                    response: ResponseOptions::spoken(None),
                };
                if let Err(e) = self.send_all([item, response]).await {
                    warn!("text injection failed: {e}");
                    let _ = self.events.send(VoiceEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
            Command::Speak(text) => {
                if self.shared.speaking.load(Ordering::SeqCst) {
                    self.barge_in().await;
                }
                let request = ClientEvent::CreateResponse {
                    response: ResponseOptions::spoken(Some(format!(
                        "Say exactly the following, naturally: {text}"
                    ))),
                };
                if let Err(e) = self.session.send(request).await {
                    warn!("speak request failed: {e}");
                    let _ = self.events.send(VoiceEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
            Command::Interrupt => {
                if self.shared.speaking.load(Ordering::SeqCst) {
                    self.barge_in().await;
                }
            }
        }
    }

    /// Run the local VAD over a microphone frame, then forward it
    /// upstream unless the assistant is speaking.
    async fn handle_audio_frame(&mut self, samples: &[i16]) {
        let floats: Vec<f32> = samples
            .iter()
            .map(|s| f32::from(*s) / f32::from(i16::MAX))
            .collect();
        match self.vad.process_frame(&floats) {
            Some(VadTransition::SpeechStarted) => {
                let _ = self.events.send(VoiceEvent::SpeechActivity { active: true });
                if self.shared.speaking.load(Ordering::SeqCst) {
                    self.barge_in().await;
                }
            }
            Some(VadTransition::SpeechEnded) => {
                let _ = self.events.send(VoiceEvent::SpeechActivity { active: false });
            }
            None => {}
        }

        if self.shared.armed.load(Ordering::SeqCst)
            && !self.shared.speaking.load(Ordering::SeqCst)
        {
            let frame = ClientEvent::AppendAudio {
                audio: protocol::encode_pcm16(samples),
            };
            if let Err(e) = self.session.send(frame).await {
                warn!("audio frame send failed: {e}");
            }
        }
    }

    /// Flush playback and cancel the in-flight response. Queue is empty
    /// and `SpeakingStopped` emitted before listening resumes.
    async fn barge_in(&mut self) {
        debug!("barge-in: flushing {} queued frames", self.queue.len());
        self.queue.clear();
        self.shared.queued.store(0, Ordering::SeqCst);
        self.playing = None;
        self.sink.stop().await;
        self.response_active = false;
        if let Err(e) = self.session.send(ClientEvent::CancelResponse).await {
            warn!("response cancel failed: {e}");
        }
        self.finish_speaking();
    }

    fn begin_speaking(&mut self) {
        if !self.shared.speaking.swap(true, Ordering::SeqCst) {
            if self.shared.armed.load(Ordering::SeqCst) {
                let _ = self.events.send(VoiceEvent::ListeningStopped);
            }
            let _ = self.events.send(VoiceEvent::SpeakingStarted);
        }
    }

    /// Leave the Speaking state exactly once, resuming listening if the
    /// microphone is still armed.
    fn finish_speaking(&mut self) {
        if self.shared.speaking.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(VoiceEvent::SpeakingStopped);
            if self.shared.armed.load(Ordering::SeqCst) {
                let _ = self.events.send(VoiceEvent::ListeningStarted);
            }
        }
    }

    async fn send_all<I>(&mut self, events: I) -> Result<()>
    where
        I: IntoIterator<Item = ClientEvent>,
    {
        for event in events {
            self.session.send(event).await?;
        }
        Ok(())
    }

    /// Common teardown for cancel, peer close, and receive error.
    async fn shutdown(&mut self, peer_closed: bool) {
        self.queue.clear();
        self.shared.queued.store(0, Ordering::SeqCst);
        self.playing = None;
        self.sink.stop().await;
        self.response_active = false;
        if self.shared.speaking.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(VoiceEvent::SpeakingStopped);
        }
        if self.shared.armed.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(VoiceEvent::ListeningStopped);
        }
        if peer_closed {
            self.shared.connected.store(false, Ordering::SeqCst);
        }
        self.session.close().await;
        let _ = self.events.send(VoiceEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::events::EVENT_CHANNEL_CAPACITY;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeSession {
        server_rx: mpsc::UnboundedReceiver<ServerEvent>,
        sent: mpsc::UnboundedSender<ClientEvent>,
    }

    #[async_trait]
    impl RealtimeSession for FakeSession {
        async fn send(&mut self, event: ClientEvent) -> Result<()> {
            let _ = self.sent.send(event);
            Ok(())
        }

        async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
            self.server_rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.server_rx.close();
        }
    }

    struct FakeTransport {
        session: Mutex<Option<FakeSession>>,
        fail: bool,
    }

    impl FakeTransport {
        fn new() -> (
            Arc<Self>,
            mpsc::UnboundedSender<ServerEvent>,
            mpsc::UnboundedReceiver<ClientEvent>,
        ) {
            let (server_tx, server_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    session: Mutex::new(Some(FakeSession {
                        server_rx,
                        sent: sent_tx,
                    })),
                    fail: false,
                }),
                server_tx,
                sent_rx,
            )
        }

        fn unreachable_endpoint() -> Arc<Self> {
            Arc::new(Self {
                session: Mutex::new(None),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl RealtimeTransport for FakeTransport {
        async fn connect(&self, _config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>> {
            if self.fail {
                return Err(VoiceError::ConnectionUnavailable(
                    "endpoint unreachable".to_owned(),
                ));
            }
            let session = self
                .session
                .lock()
                .unwrap()
                .take()
                .expect("transport connects once per test");
            Ok(Box::new(session))
        }
    }

    /// Sink whose playback never finishes on its own, so frames pile
    /// up in the queue.
    struct SlowSink {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&self, _audio: Bytes, _volume: f32) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Sink that plays every frame instantly and counts them.
    struct InstantSink {
        plays: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for InstantSink {
        async fn play(&self, _audio: Bytes, _volume: f32) -> Result<()> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn channel_with(
        transport: Arc<dyn RealtimeTransport>,
        sink: Arc<dyn AudioSink>,
    ) -> (RealtimeVoiceChannel, broadcast::Receiver<VoiceEvent>) {
        let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let channel = RealtimeVoiceChannel::new(
            RealtimeConfig::default(),
            VadConfig::default(),
            transport,
            sink,
            events,
        );
        (channel, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn delta(samples: &[i16]) -> ServerEvent {
        ServerEvent::AudioDelta {
            delta: protocol::encode_pcm16(samples),
        }
    }

    #[tokio::test]
    async fn connect_configures_the_session() {
        let (transport, _server_tx, mut sent) = FakeTransport::new();
        let (channel, mut rx) = channel_with(
            transport,
            Arc::new(InstantSink {
                plays: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        assert!(channel.is_connected());
        assert!(matches!(
            sent.recv().await.unwrap(),
            ClientEvent::SessionUpdate { .. }
        ));
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, VoiceEvent::Connected))
        );
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn connect_failure_reports_connection_unavailable() {
        let (channel, _rx) = channel_with(
            FakeTransport::unreachable_endpoint(),
            Arc::new(InstantSink {
                plays: AtomicUsize::new(0),
            }),
        );

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, VoiceError::ConnectionUnavailable(_)));
        assert!(!channel.is_connected());

        // Operations on a disconnected channel fail the same way.
        assert!(matches!(
            channel.send_text_message("hello").unwrap_err(),
            VoiceError::ConnectionUnavailable(_)
        ));
        assert!(matches!(
            channel.start_listening().unwrap_err(),
            VoiceError::ConnectionUnavailable(_)
        ));
    }

    // Interrupting mid-response flushes every queued frame, emits one
    // SpeakingStopped, cancels server-side, and resumes listening only
    // after playback is fully torn down.
    #[tokio::test]
    async fn interrupt_flushes_queue_and_cancels_response() {
        let (transport, server_tx, mut sent) = FakeTransport::new();
        let sink = Arc::new(SlowSink {
            stops: AtomicUsize::new(0),
        });
        let (channel, mut rx) = channel_with(transport, Arc::clone(&sink) as Arc<dyn AudioSink>);

        channel.connect().await.unwrap();
        channel.start_listening().unwrap();

        server_tx.send(ServerEvent::ResponseCreated).unwrap();
        for _ in 0..4 {
            server_tx.send(delta(&[100i16; 160])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One frame in flight, three waiting.
        assert!(channel.is_speaking());
        assert!(!channel.is_listening());
        assert_eq!(channel.queued_frames(), 3);

        let _ = drain(&mut rx);
        channel.interrupt();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(channel.queued_frames(), 0);
        assert!(!channel.is_speaking());
        assert!(channel.is_listening());
        assert!(sink.stops.load(Ordering::SeqCst) >= 1);

        let events = drain(&mut rx);
        let stopped = events
            .iter()
            .filter(|e| matches!(e, VoiceEvent::SpeakingStopped))
            .count();
        assert_eq!(stopped, 1);
        let stop_at = events
            .iter()
            .position(|e| matches!(e, VoiceEvent::SpeakingStopped))
            .unwrap();
        let listen_at = events
            .iter()
            .position(|e| matches!(e, VoiceEvent::ListeningStarted))
            .unwrap();
        assert!(stop_at < listen_at);

        let mut cancelled = false;
        while let Ok(event) = sent.try_recv() {
            if matches!(event, ClientEvent::CancelResponse) {
                cancelled = true;
            }
        }
        assert!(cancelled);
        channel.disconnect().await;
    }

    // Remote VAD speech onset during playback triggers the same
    // barge-in path as a local interrupt.
    #[tokio::test]
    async fn remote_speech_onset_barges_in() {
        let (transport, server_tx, mut sent) = FakeTransport::new();
        let (channel, mut rx) = channel_with(
            transport,
            Arc::new(SlowSink {
                stops: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        channel.start_listening().unwrap();
        server_tx.send(ServerEvent::ResponseCreated).unwrap();
        server_tx.send(delta(&[100i16; 160])).unwrap();
        server_tx.send(delta(&[100i16; 160])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.is_speaking());

        server_tx.send(ServerEvent::SpeechStarted).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!channel.is_speaking());
        assert_eq!(channel.queued_frames(), 0);
        let mut cancelled = false;
        while let Ok(event) = sent.try_recv() {
            if matches!(event, ClientEvent::CancelResponse) {
                cancelled = true;
            }
        }
        assert!(cancelled);
        let _ = drain(&mut rx);
        channel.disconnect().await;
    }

    // Frames play back-to-back and Speaking ends only after response
    // done AND the queue has fully drained.
    #[tokio::test]
    async fn playback_drains_queue_before_speaking_ends() {
        let (transport, server_tx, _sent) = FakeTransport::new();
        let sink = Arc::new(InstantSink {
            plays: AtomicUsize::new(0),
        });
        let (channel, mut rx) = channel_with(transport, Arc::clone(&sink) as Arc<dyn AudioSink>);

        channel.connect().await.unwrap();
        server_tx.send(ServerEvent::ResponseCreated).unwrap();
        for _ in 0..3 {
            server_tx.send(delta(&[50i16; 160])).unwrap();
        }
        server_tx.send(ServerEvent::ResponseDone).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!channel.is_speaking());
        assert_eq!(sink.plays.load(Ordering::SeqCst), 3);

        let events = drain(&mut rx);
        let started = events
            .iter()
            .filter(|e| matches!(e, VoiceEvent::SpeakingStarted))
            .count();
        let stopped = events
            .iter()
            .filter(|e| matches!(e, VoiceEvent::SpeakingStopped))
            .count();
        assert_eq!((started, stopped), (1, 1));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn mic_frames_forward_only_while_listening() {
        let (transport, server_tx, mut sent) = FakeTransport::new();
        let (channel, _rx) = channel_with(
            transport,
            Arc::new(SlowSink {
                stops: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        let _ = sent.recv().await; // session.update

        channel.start_listening().unwrap();
        channel.push_audio(&[2000i16; 160]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            sent.try_recv().unwrap(),
            ClientEvent::AppendAudio { .. }
        ));

        // Enter Speaking; half-duplex drops upstream frames.
        server_tx.send(ServerEvent::ResponseCreated).unwrap();
        server_tx.send(delta(&[100i16; 160])).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(channel.is_speaking());
        channel.push_audio(&[10i16; 160]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            !matches!(sent.try_recv(), Ok(ClientEvent::AppendAudio { .. })),
            "frames must not stream upstream while speaking"
        );
        channel.disconnect().await;
    }

    // Loud microphone frames during playback trip the local VAD and
    // barge in without waiting for the server.
    #[tokio::test]
    async fn local_vad_onset_barges_in() {
        let (transport, server_tx, _sent) = FakeTransport::new();
        let (channel, _rx) = channel_with(
            transport,
            Arc::new(SlowSink {
                stops: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        channel.start_listening().unwrap();
        server_tx.send(ServerEvent::ResponseCreated).unwrap();
        server_tx.send(delta(&[100i16; 160])).unwrap();
        server_tx.send(delta(&[100i16; 160])).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(channel.is_speaking());

        // Default VAD needs three consecutive speech frames.
        for _ in 0..3 {
            channel.push_audio(&[8000i16; 160]);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!channel.is_speaking());
        assert!(channel.is_listening());
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn transcripts_surface_as_events() {
        let (transport, server_tx, _sent) = FakeTransport::new();
        let (channel, mut rx) = channel_with(
            transport,
            Arc::new(InstantSink {
                plays: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        server_tx
            .send(ServerEvent::InputTranscript {
                transcript: "use a stack".to_owned(),
            })
            .unwrap();
        server_tx
            .send(ServerEvent::ResponseTranscript {
                transcript: "Good idea. What is the complexity?".to_owned(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let events = drain(&mut rx);
        assert!(events.iter().any(
            |e| matches!(e, VoiceEvent::TranscriptFinal { text } if text == "use a stack")
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::AssistantTranscript { text } if text.starts_with("Good idea")
        )));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn send_text_requests_one_response_cycle() {
        let (transport, _server_tx, mut sent) = FakeTransport::new();
        let (channel, _rx) = channel_with(
            transport,
            Arc::new(InstantSink {
                plays: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        let _ = sent.recv().await; // session.update
        channel.send_text_message("I would sort first").unwrap();

        let item = sent.recv().await.unwrap();
        match item {
            ClientEvent::CreateItem { item } => {
                assert_eq!(item.role, "user");
                assert_eq!(item.content[0].text, "I would sort first");
            }
            other => panic!("expected item creation, got {other:?}"),
        }
        assert!(matches!(
            sent.recv().await.unwrap(),
            ClientEvent::CreateResponse { .. }
        ));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn peer_close_tears_the_channel_down() {
        let (transport, server_tx, _sent) = FakeTransport::new();
        let (channel, mut rx) = channel_with(
            transport,
            Arc::new(InstantSink {
                plays: AtomicUsize::new(0),
            }),
        );

        channel.connect().await.unwrap();
        channel.start_listening().unwrap();
        drop(server_tx);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!channel.is_connected());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, VoiceEvent::Disconnected))
        );
    }
}
