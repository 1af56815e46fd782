//! Traits abstraits pour le transport vers l'agent
//!
//! Un transport ouvre une session et rend un `TransportLink` : une file
//! d'envoi, une file d'événements, et les tâches qui les servent. Le
//! `SessionChannel` ne connaît que ce trait, ce qui permet de le tester avec
//! `SimulatedTransport` sans réseau.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use audio::TransportEnvelope;

use crate::{NetworkResult, SessionConfig, SessionEvent};

/// Session ouverte et acquittée par l'agent
pub struct TransportLink {
    /// File d'envoi ; la fermer (drop) termine la tâche d'écriture
    pub outbound: mpsc::Sender<TransportEnvelope>,

    /// Événements entrants, dans l'ordre d'arrivée. Le dernier est toujours
    /// `Closed` ou `Error` (ou la fin de la file).
    pub events: mpsc::Receiver<SessionEvent>,

    /// Tâches de lecture/écriture du lien
    pub tasks: LinkTasks,
}

/// Tâches d'arrière-plan d'un lien
#[derive(Default)]
pub struct LinkTasks {
    handles: Vec<JoinHandle<()>>,
}

impl LinkTasks {
    pub fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self { handles }
    }

    /// Attend la fin des tâches pendant `grace`, puis les interrompt
    ///
    /// La file d'envoi doit avoir été fermée avant, sinon l'écriture ne se
    /// termine jamais d'elle-même.
    pub async fn shutdown(self, grace: Duration) {
        for mut handle in self.handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                debug!("tâche du lien interrompue après {:?}", grace);
                handle.abort();
            }
        }
    }

    /// Interrompt les tâches sans attendre (utilisé au drop)
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Trait pour ouvrir une session avec l'agent distant
///
/// `open` ne se termine qu'une fois la session acquittée. Annuler le future
/// (timeout, abort) abandonne la tentative sans laisser de connexion.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn open(&self, session: &SessionConfig) -> NetworkResult<TransportLink>;

    /// Description courte pour les logs
    fn describe(&self) -> String;
}
