//! Mode arbitration between the traditional and realtime voice paths.
//!
//! Exactly one mode is active at a time. Switching modes performs a
//! full stop of the outgoing mode (capture and playback both) before
//! the incoming mode starts, so the microphone and the speaker are
//! never claimed by two channels at once. When the realtime endpoint
//! cannot be reached the coordinator degrades to traditional mode
//! instead of failing the session.

use crate::config::InterviewConfig;
use crate::error::{Result, VoiceError};
use crate::events::{EVENT_CHANNEL_CAPACITY, VoiceEvent};
use crate::realtime::transport::RealtimeTransport;
use crate::realtime::RealtimeVoiceChannel;
use crate::recognition::{RecognitionSource, SpeechRecognitionChannel};
use crate::synthesis::{AudioSink, SpeechSynthesisChannel, SynthesisApi};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Which voice path is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceMode {
    /// Discrete recognition + synthesis over request/response APIs.
    #[default]
    Traditional,
    /// Streaming speech-to-speech over one persistent session.
    Realtime,
}

impl fmt::Display for VoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Traditional => write!(f, "traditional"),
            Self::Realtime => write!(f, "realtime"),
        }
    }
}

/// Snapshot of the voice layer for UI polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceState {
    pub mode: VoiceMode,
    pub enabled: bool,
    pub connected: bool,
    pub listening: bool,
    pub speaking: bool,
    /// Text of the utterance currently being captured. Empty in
    /// realtime mode, where transcription happens server-side and
    /// arrives only as completed turns.
    pub transcript: String,
}

/// Routes voice operations to whichever channel set is active.
pub struct VoiceModeCoordinator {
    recognition: SpeechRecognitionChannel,
    synthesis: SpeechSynthesisChannel,
    realtime: RealtimeVoiceChannel,
    events: broadcast::Sender<VoiceEvent>,
    mode: Mutex<VoiceMode>,
    enabled: AtomicBool,
    /// Traditional-mode capture intent. Stays set while playback
    /// temporarily pauses the microphone so capture can resume after.
    armed: AtomicBool,
}

impl VoiceModeCoordinator {
    /// Build a coordinator over the four device/provider collaborators.
    /// Starts in traditional mode.
    pub fn new(
        config: &InterviewConfig,
        recognition_source: Arc<dyn RecognitionSource>,
        synthesis_api: Arc<dyn SynthesisApi>,
        sink: Arc<dyn AudioSink>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(
            config,
            recognition_source,
            synthesis_api,
            sink,
            transport,
            events,
        )
    }

    /// Build a coordinator publishing into an existing event stream.
    pub fn with_events(
        config: &InterviewConfig,
        recognition_source: Arc<dyn RecognitionSource>,
        synthesis_api: Arc<dyn SynthesisApi>,
        sink: Arc<dyn AudioSink>,
        transport: Arc<dyn RealtimeTransport>,
        events: broadcast::Sender<VoiceEvent>,
    ) -> Self {
        let recognition = SpeechRecognitionChannel::new(
            recognition_source,
            config.recognition.clone(),
            events.clone(),
        );
        let synthesis = SpeechSynthesisChannel::new(
            synthesis_api,
            Arc::clone(&sink),
            config.synthesis.clone(),
            events.clone(),
        );
        let realtime = RealtimeVoiceChannel::new(
            config.realtime.clone(),
            config.vad.clone(),
            transport,
            sink,
            events.clone(),
        );
        Self {
            recognition,
            synthesis,
            realtime,
            events,
            mode: Mutex::new(VoiceMode::Traditional),
            enabled: AtomicBool::new(true),
            armed: AtomicBool::new(false),
        }
    }

    /// Subscribe to the shared voice event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn mode(&self) -> VoiceMode {
        match self.mode.lock() {
            Ok(guard) => *guard,
            Err(_) => VoiceMode::Traditional,
        }
    }

    /// Snapshot of mode, connection, and activity flags.
    #[must_use]
    pub fn state(&self) -> VoiceState {
        let mode = self.mode();
        let enabled = self.is_enabled();
        match mode {
            VoiceMode::Traditional => VoiceState {
                mode,
                enabled,
                connected: false,
                listening: self.recognition.is_listening(),
                speaking: self.synthesis.is_speaking(),
                transcript: self.recognition.current_transcript(),
            },
            VoiceMode::Realtime => VoiceState {
                mode,
                enabled,
                connected: self.realtime.is_connected(),
                listening: self.realtime.is_listening(),
                speaking: self.realtime.is_speaking(),
                transcript: String::new(),
            },
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the voice layer as a whole. Disabling stops
    /// all capture and playback; listen and speak requests are
    /// rejected until re-enabled.
    pub async fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        info!("voice {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            self.stop_all().await;
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(VoiceError::Session("voice is disabled".to_owned()))
        }
    }

    /// Switch modes, fully stopping the outgoing mode first. No-op when
    /// the requested mode is already active.
    ///
    /// A realtime request whose connection fails degrades to
    /// traditional mode and still returns `Ok`; the emitted
    /// `ModeChanged` event carries the mode actually in effect.
    pub async fn set_mode(&self, requested: VoiceMode) -> Result<()> {
        if self.mode() == requested {
            return Ok(());
        }
        self.stop_all().await;

        let effective = match requested {
            VoiceMode::Realtime => match self.realtime.connect().await {
                Ok(()) => VoiceMode::Realtime,
                Err(e) => {
                    warn!("realtime unavailable, staying traditional: {e}");
                    let _ = self.events.send(VoiceEvent::Error {
                        message: format!("realtime voice unavailable: {e}"),
                    });
                    VoiceMode::Traditional
                }
            },
            VoiceMode::Traditional => {
                self.realtime.disconnect().await;
                VoiceMode::Traditional
            }
        };

        if let Ok(mut guard) = self.mode.lock() {
            *guard = effective;
        }
        info!("voice mode is now {effective}");
        let _ = self.events.send(VoiceEvent::ModeChanged { mode: effective });
        Ok(())
    }

    /// Begin capturing user speech on the active channel.
    ///
    /// In realtime mode a dropped session is reconnected first; if the
    /// reconnect fails the coordinator falls back to traditional mode
    /// and starts listening there.
    pub async fn start_listening(&self) -> Result<()> {
        self.ensure_enabled()?;
        match self.mode() {
            VoiceMode::Traditional => self.start_traditional_capture().await,
            VoiceMode::Realtime => {
                if !self.realtime.is_connected() {
                    if let Err(e) = self.realtime.connect().await {
                        warn!("realtime reconnect failed, falling back: {e}");
                        if let Ok(mut guard) = self.mode.lock() {
                            *guard = VoiceMode::Traditional;
                        }
                        let _ = self.events.send(VoiceEvent::ModeChanged {
                            mode: VoiceMode::Traditional,
                        });
                        return self.start_traditional_capture().await;
                    }
                }
                self.realtime.start_listening()
            }
        }
    }

    /// Traditional capture start. The mic and the speaker are
    /// half-duplex: any in-flight playback is cut off before the mic
    /// opens, so the channel never captures its own output.
    async fn start_traditional_capture(&self) -> Result<()> {
        self.synthesis.stop().await;
        self.armed.store(true, Ordering::SeqCst);
        let result = self.recognition.start().await;
        if result.is_err() {
            self.armed.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Reopen the mic once traditional playback has finished, if
    /// capture was armed when the playback request paused it.
    async fn resume_capture_after_playback(&self) {
        if !self.armed.load(Ordering::SeqCst)
            || !self.is_enabled()
            || self.synthesis.is_speaking()
            || self.recognition.is_listening()
        {
            return;
        }
        if let Err(e) = self.recognition.start().await {
            warn!("could not resume capture after playback: {e}");
            let _ = self.events.send(VoiceEvent::Error {
                message: format!("could not resume capture: {e}"),
            });
        }
    }

    /// Stop capturing on the active channel, finalizing any buffered
    /// speech.
    pub async fn stop_listening(&self) {
        match self.mode() {
            VoiceMode::Traditional => {
                self.armed.store(false, Ordering::SeqCst);
                self.recognition.stop().await;
            }
            VoiceMode::Realtime => self.realtime.stop_listening(),
        }
    }

    /// Speak the given text on the active channel. A newer request
    /// supersedes whatever is currently playing.
    ///
    /// In traditional mode an open mic is paused for the duration of
    /// playback and reopened afterwards, mirroring the half-duplex
    /// policy the realtime channel enforces internally.
    ///
    /// # Errors
    ///
    /// Propagates synthesis or session errors from the active channel.
    pub async fn speak(&self, text: &str) -> Result<()> {
        self.ensure_enabled()?;
        match self.mode() {
            VoiceMode::Traditional => {
                if self.recognition.is_listening() {
                    self.recognition.stop().await;
                }
                let result = self.synthesis.speak(text).await;
                self.resume_capture_after_playback().await;
                result
            }
            VoiceMode::Realtime => self.realtime.speak(text),
        }
    }

    /// Cut off assistant playback immediately.
    pub async fn interrupt(&self) {
        match self.mode() {
            VoiceMode::Traditional => {
                self.synthesis.stop().await;
                self.resume_capture_after_playback().await;
            }
            VoiceMode::Realtime => self.realtime.interrupt(),
        }
    }

    /// Stop all capture and playback in both modes. The realtime
    /// session stays connected; use [`Self::shutdown`] to drop it.
    pub async fn stop_all(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.recognition.stop().await;
        self.synthesis.stop().await;
        if self.realtime.is_connected() {
            self.realtime.stop_listening();
            self.realtime.interrupt();
        }
    }

    /// Full teardown: stop everything and close the realtime session.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.realtime.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::RealtimeConfig;
    use crate::error::VoiceError;
    use crate::realtime::protocol::{ClientEvent, ServerEvent};
    use crate::realtime::transport::RealtimeSession;
    use crate::recognition::SourceEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Source that emits nothing but keeps its event stream open while
    /// capturing, like a real microphone with a silent room.
    #[derive(Default)]
    struct IdleSource {
        keepalive: Mutex<Option<mpsc::Sender<SourceEvent>>>,
    }

    #[async_trait]
    impl RecognitionSource for IdleSource {
        async fn start(
            &self,
            _config: &crate::config::RecognitionConfig,
            events: mpsc::Sender<SourceEvent>,
        ) -> Result<()> {
            if let Ok(mut guard) = self.keepalive.lock() {
                *guard = Some(events);
            }
            Ok(())
        }

        async fn stop(&self) {
            if let Ok(mut guard) = self.keepalive.lock() {
                *guard = None;
            }
        }
    }

    struct InstantApi;

    #[async_trait]
    impl SynthesisApi for InstantApi {
        async fn synthesize(
            &self,
            _text: &str,
            _settings: &crate::config::SynthesisConfig,
        ) -> Result<Bytes> {
            Ok(Bytes::from_static(b"pcm"))
        }
    }

    struct NullSink;

    #[async_trait]
    impl AudioSink for NullSink {
        async fn play(&self, _audio: Bytes, _volume: f32) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) {}
    }

    /// Sink whose playback takes long enough to observe mid-flight.
    struct SlowSink;

    #[async_trait]
    impl AudioSink for SlowSink {
        async fn play(&self, _audio: Bytes, _volume: f32) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        }

        async fn stop(&self) {}
    }

    /// Source that hands its event sender to the test so partial
    /// transcripts can be injected.
    struct HandoffSource {
        handoff: mpsc::UnboundedSender<mpsc::Sender<SourceEvent>>,
    }

    #[async_trait]
    impl RecognitionSource for HandoffSource {
        async fn start(
            &self,
            _config: &crate::config::RecognitionConfig,
            events: mpsc::Sender<SourceEvent>,
        ) -> Result<()> {
            let _ = self.handoff.send(events);
            Ok(())
        }

        async fn stop(&self) {}
    }

    struct DeadTransport;

    #[async_trait]
    impl RealtimeTransport for DeadTransport {
        async fn connect(&self, _config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>> {
            Err(VoiceError::ConnectionUnavailable(
                "endpoint unreachable".to_owned(),
            ))
        }
    }

    struct LoopbackSession {
        server_rx: mpsc::UnboundedReceiver<ServerEvent>,
        /// Keeps the stream open; dropping it would close the session.
        _keepalive: mpsc::UnboundedSender<ServerEvent>,
    }

    #[async_trait]
    impl RealtimeSession for LoopbackSession {
        async fn send(&mut self, _event: ClientEvent) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
            self.server_rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.server_rx.close();
        }
    }

    /// Transport that connects successfully every time.
    struct LiveTransport;

    #[async_trait]
    impl RealtimeTransport for LiveTransport {
        async fn connect(&self, _config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>> {
            let (tx, server_rx) = mpsc::unbounded_channel();
            Ok(Box::new(LoopbackSession {
                server_rx,
                _keepalive: tx,
            }))
        }
    }

    /// Session the server closes as soon as it is established.
    struct DyingSession;

    #[async_trait]
    impl RealtimeSession for DyingSession {
        async fn send(&mut self, _event: ClientEvent) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
            None
        }

        async fn close(&mut self) {}
    }

    /// Transport whose first connect succeeds and every later one
    /// fails, modeling an endpoint that goes away mid-interview.
    struct FlakyTransport {
        connected_once: std::sync::atomic::AtomicBool,
    }

    impl FlakyTransport {
        fn new() -> Self {
            Self {
                connected_once: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RealtimeTransport for FlakyTransport {
        async fn connect(&self, _config: &RealtimeConfig) -> Result<Box<dyn RealtimeSession>> {
            if self.connected_once.swap(true, Ordering::SeqCst) {
                Err(VoiceError::ConnectionUnavailable(
                    "endpoint gone".to_owned(),
                ))
            } else {
                Ok(Box::new(DyingSession))
            }
        }
    }

    fn coordinator_parts(
        source: Arc<dyn RecognitionSource>,
        sink: Arc<dyn AudioSink>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> VoiceModeCoordinator {
        VoiceModeCoordinator::new(
            &InterviewConfig::default(),
            source,
            Arc::new(InstantApi),
            sink,
            transport,
        )
    }

    fn coordinator_with(transport: Arc<dyn RealtimeTransport>) -> VoiceModeCoordinator {
        coordinator_parts(Arc::new(IdleSource::default()), Arc::new(NullSink), transport)
    }

    fn drain(rx: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn starts_in_traditional_mode() {
        let coordinator = coordinator_with(Arc::new(LiveTransport));
        assert_eq!(coordinator.mode(), VoiceMode::Traditional);
        let state = coordinator.state();
        assert!(state.enabled);
        assert!(!state.listening);
        assert!(!state.speaking);
        assert!(!state.connected);
        assert!(state.transcript.is_empty());
    }

    #[tokio::test]
    async fn switching_to_realtime_connects_the_session() {
        let coordinator = coordinator_with(Arc::new(LiveTransport));
        let mut rx = coordinator.subscribe();

        coordinator.set_mode(VoiceMode::Realtime).await.unwrap();
        assert_eq!(coordinator.mode(), VoiceMode::Realtime);
        assert!(coordinator.state().connected);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::ModeChanged {
                mode: VoiceMode::Realtime
            }
        )));
        coordinator.shutdown().await;
    }

    // An unreachable realtime endpoint degrades to traditional mode:
    // the call succeeds, the mode stays usable, and the mode change is
    // announced.
    #[tokio::test]
    async fn realtime_failure_falls_back_to_traditional() {
        let coordinator = coordinator_with(Arc::new(DeadTransport));
        let mut rx = coordinator.subscribe();

        coordinator.set_mode(VoiceMode::Realtime).await.unwrap();
        assert_eq!(coordinator.mode(), VoiceMode::Traditional);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::ModeChanged {
                mode: VoiceMode::Traditional
            }
        )));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, VoiceEvent::Error { .. }))
        );

        // The degraded session still listens and speaks.
        coordinator.start_listening().await.unwrap();
        assert!(coordinator.state().listening);
        coordinator.stop_listening().await;
        coordinator.speak("let's continue").await.unwrap();
    }

    #[tokio::test]
    async fn set_mode_is_a_no_op_when_unchanged() {
        let coordinator = coordinator_with(Arc::new(DeadTransport));
        let mut rx = coordinator.subscribe();
        coordinator.set_mode(VoiceMode::Traditional).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn mode_switch_stops_the_outgoing_channel() {
        let coordinator = coordinator_with(Arc::new(LiveTransport));
        coordinator.start_listening().await.unwrap();
        assert!(coordinator.state().listening);

        coordinator.set_mode(VoiceMode::Realtime).await.unwrap();
        // Traditional capture was stopped before the switch.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!coordinator.recognition.is_listening());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn realtime_dispatch_reaches_the_streaming_channel() {
        let coordinator = coordinator_with(Arc::new(LiveTransport));
        coordinator.set_mode(VoiceMode::Realtime).await.unwrap();

        coordinator.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(coordinator.state().listening);

        coordinator.stop_listening().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!coordinator.state().listening);
        coordinator.shutdown().await;
    }

    // Traditional mode is half-duplex like the realtime channel: an
    // open mic is paused while the assistant speaks, so the capture
    // path never hears the assistant's own playback, and it reopens
    // once playback finishes.
    #[tokio::test]
    async fn traditional_playback_pauses_and_resumes_capture() {
        let coordinator = Arc::new(coordinator_parts(
            Arc::new(IdleSource::default()),
            Arc::new(SlowSink),
            Arc::new(DeadTransport),
        ));
        coordinator.start_listening().await.unwrap();
        assert!(coordinator.state().listening);

        let speak = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.speak("take your time").await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;

        let state = coordinator.state();
        assert!(state.speaking);
        assert!(!state.listening, "mic open during assistant playback");

        speak.await.unwrap().unwrap();
        let state = coordinator.state();
        assert!(!state.speaking);
        assert!(state.listening, "mic did not reopen after playback");
    }

    #[tokio::test]
    async fn starting_capture_cuts_off_playback() {
        let coordinator = Arc::new(coordinator_parts(
            Arc::new(IdleSource::default()),
            Arc::new(SlowSink),
            Arc::new(DeadTransport),
        ));
        let speak = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.speak("a long explanation").await })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(coordinator.state().speaking);

        coordinator.start_listening().await.unwrap();
        let state = coordinator.state();
        assert!(state.listening);
        assert!(!state.speaking, "playback survived the mic opening");

        speak.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.state().listening);
    }

    #[tokio::test]
    async fn disabling_voice_stops_activity_and_blocks_requests() {
        let coordinator = coordinator_with(Arc::new(DeadTransport));
        coordinator.start_listening().await.unwrap();
        assert!(coordinator.state().listening);

        coordinator.set_enabled(false).await;
        let state = coordinator.state();
        assert!(!state.enabled);
        assert!(!state.listening);
        assert!(matches!(
            coordinator.start_listening().await.unwrap_err(),
            VoiceError::Session(_)
        ));
        assert!(matches!(
            coordinator.speak("anything").await.unwrap_err(),
            VoiceError::Session(_)
        ));

        coordinator.set_enabled(true).await;
        coordinator.start_listening().await.unwrap();
        assert!(coordinator.state().listening);
    }

    #[tokio::test]
    async fn state_surfaces_the_in_progress_transcript() {
        let (handoff, mut handoff_rx) = mpsc::unbounded_channel();
        let coordinator = coordinator_parts(
            Arc::new(HandoffSource { handoff }),
            Arc::new(NullSink),
            Arc::new(DeadTransport),
        );
        coordinator.start_listening().await.unwrap();
        let source_tx = handoff_rx.recv().await.unwrap();

        source_tx
            .send(SourceEvent::Partial("two pointers from".to_owned()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(coordinator.state().transcript, "two pointers from");
    }

    // A realtime session the server drops is reconnected on the next
    // listen request; when that reconnect fails too the coordinator
    // falls back to traditional capture and announces the change.
    #[tokio::test]
    async fn lost_session_falls_back_on_start_listening() {
        let coordinator = coordinator_with(Arc::new(FlakyTransport::new()));
        let mut rx = coordinator.subscribe();

        coordinator.set_mode(VoiceMode::Realtime).await.unwrap();
        assert_eq!(coordinator.mode(), VoiceMode::Realtime);

        // The server closes the session right away.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!coordinator.state().connected);
        drain(&mut rx);

        coordinator.start_listening().await.unwrap();
        assert_eq!(coordinator.mode(), VoiceMode::Traditional);
        assert!(coordinator.state().listening);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            VoiceEvent::ModeChanged {
                mode: VoiceMode::Traditional
            }
        )));
    }
}
