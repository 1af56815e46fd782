//! Planification gapless des buffers reçus
//!
//! Le planificateur tient un curseur `next_start` (horloge de sortie, en
//! secondes). Pour chaque buffer, dans l'ordre d'arrivée :
//!
//! ```text
//! start      = max(next_start, horloge courante)
//! next_start = start + durée du buffer
//! ```
//!
//! Les buffers s'enchaînent donc sans trou ni chevauchement, même quand ils
//! arrivent en rafale ou en retard. Le curseur est initialisé à l'horloge
//! au premier buffer d'un appel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::{AudioOutput, AudioResult, OnEnded, PlaybackBuffer, VoiceId};

/// Résultat d'une planification
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduledPlayback {
    pub voice: VoiceId,
    /// Instant de départ (horloge de sortie, secondes)
    pub start: f64,
    /// Instant de fin prévu
    pub end: f64,
}

type ActiveSet = Arc<Mutex<HashSet<VoiceId>>>;

fn lock_active(active: &Mutex<HashSet<VoiceId>>) -> MutexGuard<'_, HashSet<VoiceId>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Planificateur de lecture séquentielle
///
/// Possède explicitement l'ensemble des lectures actives. Chaque lecture
/// se retire elle-même de l'ensemble à sa fin naturelle ; `stop_all()`
/// arrête de force tout ce qui reste.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start: Option<f64>,
    active: ActiveSet,
    next_voice: u64,
    scheduled_total: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Curseur courant (None tant que rien n'a été planifié)
    pub fn next_start_time(&self) -> Option<f64> {
        self.next_start
    }

    /// Instant de départ qu'aurait le prochain buffer pour cette horloge
    pub fn start_time_for(&self, clock: f64) -> f64 {
        match self.next_start {
            Some(next) => next.max(clock),
            None => clock,
        }
    }

    /// Nombre de lectures planifiées ou en cours
    pub fn active_count(&self) -> usize {
        lock_active(&self.active).len()
    }

    /// Nombre total de buffers planifiés depuis la création
    pub fn scheduled_total(&self) -> u64 {
        self.scheduled_total
    }

    /// Planifie un buffer à la suite du précédent
    ///
    /// En cas d'échec de la sortie, le curseur n'avance pas et la lecture
    /// n'est pas comptée comme active.
    pub fn schedule(
        &mut self,
        output: &dyn AudioOutput,
        buffer: PlaybackBuffer,
    ) -> AudioResult<ScheduledPlayback> {
        let clock = output.current_time();
        let start = self.start_time_for(clock);
        let duration = buffer.duration();

        let voice = VoiceId(self.next_voice);
        self.next_voice += 1;

        // Enregistrée avant l'appel : une fin très rapide trouve l'entrée
        lock_active(&self.active).insert(voice);

        let active = Arc::clone(&self.active);
        let on_ended: OnEnded = Box::new(move || {
            lock_active(&active).remove(&voice);
            trace!(%voice, "lecture terminée");
        });

        if let Err(e) = output.schedule(voice, buffer, start, on_ended) {
            lock_active(&self.active).remove(&voice);
            return Err(e);
        }

        let end = start + duration;
        self.next_start = Some(end);
        self.scheduled_total += 1;

        debug!(%voice, start, end, clock, "buffer planifié");
        Ok(ScheduledPlayback { voice, start, end })
    }

    /// Arrête de force toutes les lectures actives et vide l'ensemble
    ///
    /// Le curseur est remis à zéro : le prochain buffer repartira de
    /// l'horloge courante.
    pub fn stop_all(&mut self, output: &dyn AudioOutput) -> usize {
        let voices: Vec<VoiceId> = lock_active(&self.active).drain().collect();

        for voice in &voices {
            output.stop(*voice);
        }
        self.next_start = None;

        if !voices.is_empty() {
            debug!(stopped = voices.len(), "lectures arrêtées");
        }
        voices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedOutput;
    use crate::AudioOutput;

    fn buffer(duration_ms: u32) -> PlaybackBuffer {
        let rate = 24000;
        PlaybackBuffer::new(vec![0.1; (rate / 1000 * duration_ms) as usize], rate)
    }

    async fn open_output() -> SimulatedOutput {
        let mut output = SimulatedOutput::new(24000);
        output.open().await.unwrap();
        output
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[tokio::test]
    async fn test_burst_is_gapless() {
        let output = open_output().await;
        let probe = output.probe();
        probe.set_time(2.0);

        let mut scheduler = PlaybackScheduler::new();
        let durations = [100, 250, 40, 300];
        let mut results = Vec::new();
        for ms in durations {
            results.push(scheduler.schedule(&output, buffer(ms)).unwrap());
        }

        assert!(approx(results[0].start, 2.0));
        for pair in results.windows(2) {
            assert!(approx(pair[1].start, pair[0].end));
        }
        assert!(approx(results[3].end, 2.69));
        assert_eq!(scheduler.active_count(), 4);
    }

    #[tokio::test]
    async fn test_late_arrival_starts_at_clock() {
        let output = open_output().await;
        let probe = output.probe();
        let mut scheduler = PlaybackScheduler::new();

        let first = scheduler.schedule(&output, buffer(100)).unwrap();
        assert!(approx(first.start, 0.0));

        // La sortie a avancé bien au-delà de la fin du premier buffer
        probe.set_time(0.5);
        let second = scheduler.schedule(&output, buffer(100)).unwrap();
        assert!(approx(second.start, 0.5));

        // Arrivée pendant la lecture du second : enchaînement exact
        probe.set_time(0.55);
        let third = scheduler.schedule(&output, buffer(100)).unwrap();
        assert!(approx(third.start, second.end));
    }

    #[tokio::test]
    async fn test_natural_completion_removes_handle() {
        let output = open_output().await;
        let probe = output.probe();
        let mut scheduler = PlaybackScheduler::new();

        scheduler.schedule(&output, buffer(100)).unwrap();
        scheduler.schedule(&output, buffer(100)).unwrap();
        assert_eq!(scheduler.active_count(), 2);

        probe.set_time(0.1);
        assert_eq!(scheduler.active_count(), 1);

        probe.set_time(0.2);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_all_clears_and_resets_cursor() {
        let output = open_output().await;
        let probe = output.probe();
        let mut scheduler = PlaybackScheduler::new();

        for _ in 0..3 {
            scheduler.schedule(&output, buffer(200)).unwrap();
        }
        assert_eq!(scheduler.stop_all(&output), 3);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(probe.active_voices(), 0);
        assert_eq!(probe.stopped_count(), 3);
        assert_eq!(scheduler.next_start_time(), None);

        // Aucun callback de fin après un arrêt forcé
        probe.set_time(10.0);
        assert_eq!(scheduler.active_count(), 0);

        // Second appel : rien à arrêter, pas d'erreur
        assert_eq!(scheduler.stop_all(&output), 0);

        let next = scheduler.schedule(&output, buffer(100)).unwrap();
        assert!(approx(next.start, 10.0));
    }

    #[tokio::test]
    async fn test_failed_schedule_keeps_cursor() {
        // Sortie jamais ouverte : planification refusée
        let output = SimulatedOutput::new(24000);
        let mut scheduler = PlaybackScheduler::new();

        assert!(scheduler.schedule(&output, buffer(100)).is_err());
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start_time(), None);
        assert_eq!(scheduler.scheduled_total(), 0);
    }
}
