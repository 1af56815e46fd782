//! Crate console - Pont vocal entre l'opérateur support et l'agent distant
//!
//! Ce crate assemble les crates `audio` et `network` autour du contrôleur
//! d'appel :
//! - `config` : configuration complète (audio, réseau, agent, consigne)
//! - `controller` : l'acteur `CallController` et sa poignée `CallHandle`
//! - `error` : taxonomie des erreurs d'appel
//!
//! L'interface (ici la CLI `voice-console`) ne fait qu'envoyer des commandes
//! au contrôleur et afficher le `CallStatus` publié.

pub mod config;
pub mod controller;
pub mod error;

pub use config::{ConsoleConfig, DEFAULT_AGENT_ID, DEFAULT_INSTRUCTION};
pub use controller::{
    format_elapsed, CallController, CallDevices, CallHandle, CallState, CallStatus, CaptureFactory,
    OutputFactory,
};
pub use error::{CallError, CallResult};

/// Tests d'intégration : appels complets sur périphériques et agent simulés
#[cfg(test)]
mod integration_tests {
    use super::*;
    use audio::simulated::{CaptureProbe, OutputProbe};
    use audio::{
        AudioCapture, AudioCodec, AudioConfig, AudioFrame, AudioOutput, PcmCodec, SimulatedCapture,
        SimulatedFailure, SimulatedOutput, TransportEnvelope,
    };
    use network::{NetworkConfig, SessionEvent, SimulatedAgent, SimulatedTransport};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Rig {
        handle: CallHandle,
        agent: SimulatedAgent,
        mics: Arc<Mutex<Vec<CaptureProbe>>>,
        speakers: Arc<Mutex<Vec<OutputProbe>>>,
    }

    impl Rig {
        fn new(transport: SimulatedTransport) -> Self {
            Self::with_failures(transport, None, None)
        }

        fn with_mic(transport: SimulatedTransport, mic_failure: Option<SimulatedFailure>) -> Self {
            Self::with_failures(transport, mic_failure, None)
        }

        fn with_failures(
            transport: SimulatedTransport,
            mic_failure: Option<SimulatedFailure>,
            speaker_failure: Option<SimulatedFailure>,
        ) -> Self {
            let agent = transport.agent();
            let mics = Arc::new(Mutex::new(Vec::new()));
            let speakers = Arc::new(Mutex::new(Vec::new()));

            let devices = CallDevices {
                capture: {
                    let mics = Arc::clone(&mics);
                    Box::new(move |audio: &AudioConfig| -> Box<dyn AudioCapture> {
                        let capture = match mic_failure {
                            Some(failure) => SimulatedCapture::failing(audio.clone(), failure),
                            None => SimulatedCapture::new(audio.clone()),
                        };
                        mics.lock().unwrap().push(capture.probe());
                        Box::new(capture)
                    })
                },
                output: {
                    let speakers = Arc::clone(&speakers);
                    Box::new(move |audio: &AudioConfig| -> Box<dyn AudioOutput> {
                        let output = match speaker_failure {
                            Some(failure) => SimulatedOutput::failing(audio.output_sample_rate, failure),
                            None => SimulatedOutput::new(audio.output_sample_rate),
                        };
                        speakers.lock().unwrap().push(output.probe());
                        Box::new(output)
                    })
                },
                transport: Arc::new(transport),
            };

            let handle = CallController::spawn(ConsoleConfig::test_config(), devices, "Jeanne Martin");
            Self {
                handle,
                agent,
                mics,
                speakers,
            }
        }

        fn mic(&self) -> CaptureProbe {
            self.mics.lock().unwrap().last().cloned().unwrap()
        }

        fn speaker(&self) -> OutputProbe {
            self.speakers.lock().unwrap().last().cloned().unwrap()
        }

        async fn wait_state(&self, state: CallState) {
            let mut status = self.handle.subscribe();
            let reached = tokio::time::timeout(Duration::from_secs(5), async move {
                status.wait_for(|s| s.state == state).await.is_ok()
            })
            .await;
            assert!(matches!(reached, Ok(true)), "état {:?} jamais atteint", state);
        }
    }

    fn transport() -> SimulatedTransport {
        SimulatedTransport::new(NetworkConfig::test_config())
    }

    /// Attend qu'une condition devienne vraie (horloge réelle ou en pause)
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition jamais remplie");
    }

    /// Réponse de l'agent : 100 ms d'audio à 24 kHz
    fn agent_audio(level: i16) -> TransportEnvelope {
        PcmCodec::new(&AudioConfig::default()).encode(&AudioFrame::new(vec![level; 2400], 24000, 0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_opens_call_and_ticks() {
        let rig = Rig::new(transport());
        assert_eq!(rig.handle.status().state, CallState::Idle);

        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Open));
        let status = rig.handle.status();
        assert_eq!(status.state, CallState::Open);
        assert_eq!(status.elapsed_seconds, 0);
        assert!(status.session_id.is_some());

        let setups = rig.agent.setups();
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].agent_id, DEFAULT_AGENT_ID);
        assert!(setups[0].instruction.contains("Jeanne Martin"));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(rig.handle.status().elapsed_seconds, 3);
        assert_eq!(format_elapsed(rig.handle.status().elapsed_seconds), "0:03");

        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Idle));
        assert_eq!(rig.handle.status().elapsed_seconds, 0);
    }

    #[tokio::test]
    async fn test_uplink_sends_every_frame_in_order() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        let mic = rig.mic();
        for level in 1..=5 {
            assert!(mic.emit(vec![level * 100; 4096]));
        }
        assert!(rig.agent.wait_for_sent(5, Duration::from_secs(2)).await);

        let codec = PcmCodec::new(&AudioConfig::default());
        let levels: Vec<i16> = rig
            .agent
            .sent()
            .iter()
            .map(|envelope| {
                assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
                let buffer = codec.decode(envelope).unwrap();
                assert_eq!(buffer.len(), 4096);
                (buffer.samples[0] * 32768.0).round() as i16
            })
            .collect();
        assert_eq!(levels, vec![100, 200, 300, 400, 500]);

        rig.handle.toggle_call().await.unwrap();

        // Plus rien ne sort une fois l'appel raccroché
        assert!(!mic.emit(vec![600; 4096]));
        assert_eq!(rig.agent.sent_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_before_open_are_not_sent() {
        let rig = Rig::new(transport().with_open_delay(Duration::from_millis(200)));

        let toggling = {
            let handle = rig.handle.clone();
            tokio::spawn(async move { handle.toggle_call().await })
        };

        rig.wait_state(CallState::Connecting).await;
        let mics = Arc::clone(&rig.mics);
        wait_until(|| mics.lock().unwrap().last().is_some_and(|mic| mic.is_open())).await;

        let mic = rig.mic();
        assert!(mic.emit(vec![1; 4096]));
        assert!(mic.emit(vec![2; 4096]));

        assert_eq!(toggling.await.unwrap(), Ok(CallState::Open));

        assert!(mic.emit(vec![3; 4096]));
        assert!(rig.agent.wait_for_sent(1, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = rig.agent.sent();
        assert_eq!(sent.len(), 1);
        let buffer = PcmCodec::new(&AudioConfig::default()).decode(&sent[0]).unwrap();
        assert_eq!((buffer.samples[0] * 32768.0).round() as i16, 3);
    }

    #[tokio::test]
    async fn test_toggle_while_open_stops_everything() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        let speaker = rig.speaker();
        assert!(rig.agent.push_audio(agent_audio(1000)));
        assert!(rig.agent.push_audio(agent_audio(2000)));
        wait_until(|| speaker.scheduled().len() == 2).await;
        assert_eq!(speaker.active_voices(), 2);

        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Idle));

        let status = rig.handle.status();
        assert_eq!(status.state, CallState::Idle);
        assert_eq!(status.elapsed_seconds, 0);
        assert!(!status.playing);
        assert_eq!(status.last_error, None);

        // stopAll, puis canal, capture et sortie libérés une seule fois
        assert_eq!(speaker.stopped_count(), 2);
        assert_eq!(speaker.active_voices(), 0);
        assert!(!rig.agent.is_connected());
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(speaker.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_is_idempotent() {
        let rig = Rig::new(transport());

        // Sans appel en cours
        rig.handle.stop_call().await.unwrap();
        assert_eq!(rig.handle.status().state, CallState::Idle);

        rig.handle.toggle_call().await.unwrap();
        rig.handle.stop_call().await.unwrap();
        rig.handle.stop_call().await.unwrap();

        assert_eq!(rig.handle.status().state, CallState::Idle);
        assert_eq!(rig.mic().open_count(), 1);
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(rig.speaker().open_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();
        let speaker = rig.speaker();

        assert!(rig.agent.push_audio(agent_audio(1000)));
        assert!(rig.agent.push_audio(TransportEnvelope::new("audio/pcm;rate=24000", "%%% pas du base64")));
        assert!(rig.agent.push_audio(TransportEnvelope::new("audio/pcm;rate=24000", "AQID"))); // 3 octets
        assert!(rig.agent.push_audio(agent_audio(2000)));

        wait_until(|| speaker.scheduled().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let records = speaker.scheduled();
        assert_eq!(records.len(), 2);
        assert!((records[0].duration - 0.1).abs() < 1e-9);
        assert!((records[1].start - (records[0].start + records[0].duration)).abs() < 1e-9);

        let status = rig.handle.status();
        assert_eq!(status.state, CallState::Open);
        assert_eq!(status.last_error, None);
        assert!(status.playing);
    }

    #[tokio::test]
    async fn test_interruption_stops_stale_audio() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();
        let speaker = rig.speaker();

        assert!(rig.agent.push_audio(agent_audio(1000)));
        assert!(rig.agent.push_audio(agent_audio(1000)));
        wait_until(|| speaker.scheduled().len() == 2).await;

        speaker.set_time(0.05);
        assert!(rig.agent.push(SessionEvent::Interrupted));
        wait_until(|| speaker.stopped_count() == 2).await;

        // Le nouveau tour repart de l'horloge courante
        assert!(rig.agent.push_audio(agent_audio(500)));
        wait_until(|| speaker.scheduled().len() == 3).await;
        assert!((speaker.scheduled()[2].start - 0.05).abs() < 1e-9);
        assert_eq!(rig.handle.status().state, CallState::Open);
    }

    #[tokio::test]
    async fn test_permission_denied_leaves_nothing_allocated() {
        let rig = Rig::with_mic(transport(), Some(SimulatedFailure::PermissionDenied));

        let result = rig.handle.toggle_call().await;
        assert!(matches!(result, Err(CallError::Permission(_))));

        let status = rig.handle.status();
        assert_eq!(status.state, CallState::Error);
        assert!(matches!(status.last_error, Some(CallError::Permission(_))));
        assert_eq!(status.session_id, None);

        let speaker = rig.speaker();
        assert_eq!(speaker.open_count(), 1);
        assert_eq!(speaker.close_count(), 1);
        assert!(!speaker.is_open());
        assert!(!rig.mic().is_open());
        assert_eq!(rig.agent.open_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_microphone_is_a_device_error() {
        let rig = Rig::with_mic(transport(), Some(SimulatedFailure::NoDevice));

        let result = rig.handle.toggle_call().await;
        assert!(matches!(result, Err(CallError::Device(_))));

        let status = rig.handle.status();
        assert_eq!(status.state, CallState::Error);
        assert!(matches!(status.last_error, Some(CallError::Device(_))));

        let speaker = rig.speaker();
        assert_eq!(speaker.open_count(), 1);
        assert_eq!(speaker.close_count(), 1);
        assert_eq!(rig.mic().open_count(), 0);
        assert_eq!(rig.mic().close_count(), 0);
        assert_eq!(rig.agent.open_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_output_is_a_device_error() {
        let rig = Rig::with_failures(transport(), None, Some(SimulatedFailure::NoDevice));

        let result = rig.handle.toggle_call().await;
        assert!(matches!(result, Err(CallError::Device(_))));
        assert_eq!(rig.handle.status().state, CallState::Error);

        // Rien n'a été ouvert : ni micro, ni sortie, ni session
        let speaker = rig.speaker();
        assert_eq!(speaker.open_count(), 0);
        assert_eq!(speaker.close_count(), 0);
        assert!(rig.mics.lock().unwrap().is_empty());
        assert_eq!(rig.agent.open_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_microphone_ends_call_in_error() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        let mic = rig.mic();
        assert!(mic.emit(vec![100; 4096]));
        assert!(rig.agent.wait_for_sent(1, Duration::from_secs(2)).await);

        mic.fail("micro débranché");
        rig.wait_state(CallState::Error).await;

        let status = rig.handle.status();
        assert!(matches!(status.last_error, Some(CallError::Device(ref m)) if m.contains("débranché")));
        assert_eq!(mic.close_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);
        assert!(!rig.agent.is_connected());
        assert_eq!(rig.agent.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_flushes_frames_captured_before_closing() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        // Raccrochage immédiat : les blocs sont encore dans la file de capture
        let mic = rig.mic();
        for level in 1..=3 {
            assert!(mic.emit(vec![level * 100; 4096]));
        }
        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Idle));

        assert!(rig.agent.wait_for_sent(3, Duration::from_secs(1)).await);
        let codec = PcmCodec::new(&AudioConfig::default());
        let levels: Vec<i16> = rig
            .agent
            .sent()
            .iter()
            .map(|envelope| (codec.decode(envelope).unwrap().samples[0] * 32768.0).round() as i16)
            .collect();
        assert_eq!(levels, vec![100, 200, 300]);
        assert!(!mic.emit(vec![400; 4096]));
    }

    #[tokio::test]
    async fn test_remote_close_returns_to_idle() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        assert!(rig.agent.close_remote(Some("fin de session")));
        rig.wait_state(CallState::Idle).await;

        assert_eq!(rig.handle.status().last_error, None);
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);

        // Pas de reconnexion automatique : un nouvel appel est explicite
        assert_eq!(rig.agent.open_count(), 1);
        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Open));
        assert_eq!(rig.agent.open_count(), 2);
    }

    #[tokio::test]
    async fn test_remote_error_ends_call_in_error() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        assert!(rig.agent.fail_remote("réseau coupé"));
        rig.wait_state(CallState::Error).await;

        let status = rig.handle.status();
        assert_eq!(status.last_error, Some(CallError::Connection("réseau coupé".to_string())));
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_connect_cancels_late_session() {
        let rig = Rig::new(transport().with_open_delay(Duration::from_secs(1)));

        let first = {
            let handle = rig.handle.clone();
            tokio::spawn(async move { handle.toggle_call().await })
        };
        rig.wait_state(CallState::Connecting).await;

        assert_eq!(rig.handle.toggle_call().await, Ok(CallState::Idle));
        assert_eq!(first.await.unwrap(), Ok(CallState::Idle));

        // La connexion aboutit après coup et se referme d'elle-même
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rig.agent.open_count(), 1);
        assert!(!rig.agent.is_connected());
        assert_eq!(rig.handle.status().state, CallState::Idle);
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_and_allows_retry() {
        let rig = Rig::new(transport().failing("agent indisponible"));

        let result = rig.handle.toggle_call().await;
        assert!(matches!(result, Err(CallError::Connection(ref m)) if m.contains("agent indisponible")));
        assert_eq!(rig.handle.status().state, CallState::Error);
        assert_eq!(rig.mic().close_count(), 1);
        assert_eq!(rig.speaker().close_count(), 1);

        // Depuis Error, un nouveau toggle retente un appel complet
        assert!(rig.handle.toggle_call().await.is_err());
        assert_eq!(rig.agent.open_count(), 2);
        assert_eq!(rig.mics.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_and_stops_controller() {
        let rig = Rig::new(transport());
        rig.handle.toggle_call().await.unwrap();

        rig.handle.shutdown().await.unwrap();
        assert_eq!(rig.handle.status().state, CallState::Idle);
        assert_eq!(rig.mic().close_count(), 1);
        assert!(!rig.agent.is_connected());

        assert_eq!(rig.handle.toggle_call().await, Err(CallError::ControllerGone));
    }
}
