//! Notifier that records instead of sending.

use ephemera_core::{EkGeneration, EkNotifier, TeamId, Uid};
use parking_lot::Mutex;

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A team key generation was published
    NewTeamEk {
        /// Team
        team: TeamId,
        /// Published generation
        generation: EkGeneration,
    },
    /// A teambot key generation was published
    NewTeambotEk {
        /// Team
        team: TeamId,
        /// Bot
        bot: Uid,
        /// Published generation
        generation: EkGeneration,
    },
    /// A bot asked for a teambot key
    TeambotEkNeeded {
        /// Team
        team: TeamId,
        /// Bot
        bot: Uid,
        /// Generation the bot could not open, if any
        generation: Option<EkGeneration>,
    },
}

/// Collects every notification in order.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications recorded so far.
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }

    /// Drain the recorded notifications.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EkNotifier for RecordingNotifier {
    fn new_team_ek(&self, team: &TeamId, generation: EkGeneration) {
        self.events.lock().push(Notification::NewTeamEk { team: team.clone(), generation });
    }

    fn new_teambot_ek(&self, team: &TeamId, bot: &Uid, generation: EkGeneration) {
        self.events.lock().push(Notification::NewTeambotEk {
            team: team.clone(),
            bot: bot.clone(),
            generation,
        });
    }

    fn teambot_ek_needed(&self, team: &TeamId, bot: &Uid, generation: Option<EkGeneration>) {
        self.events.lock().push(Notification::TeambotEkNeeded {
            team: team.clone(),
            bot: bot.clone(),
            generation,
        });
    }
}
