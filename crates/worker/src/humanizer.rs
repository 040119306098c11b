//! Idle-identity humanization.
//!
//! Each identity wakes on a random 15–45 minute interval and performs one
//! low-stakes action so the account looks attended: reading chats, toggling
//! presence, typing and thinking better of it, peeking at statuses, or
//! sending a short silent voice note to a sibling identity on the same
//! worker.

use rand::seq::SliceRandom;
use rand::Rng;

use dr_chatwire::Connection;
use dr_domain::Result;

/// Interval between humanizer wakes, in milliseconds.
pub fn next_wake_ms(rng: &mut impl Rng) -> u64 {
    rng.gen_range(15 * 60_000..=45 * 60_000)
}

/// The short "human" pause inside an action.
#[derive(Debug, Clone, Copy)]
pub struct PauseRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for PauseRange {
    fn default() -> Self {
        Self {
            min_ms: 3_000,
            max_ms: 8_000,
        }
    }
}

impl PauseRange {
    pub fn sample(&self, rng: &mut impl Rng) -> u64 {
        rng.gen_range(self.min_ms..=self.max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleAction {
    MarkChatRead,
    PresenceToggle,
    TypeAndCancel,
    ViewStatus,
    SilentVoiceNote,
    Idle,
}

/// Draw one action: read 20%, presence 20%, type-and-cancel 20%,
/// view-status 10%, voice note 15%, idle 15%.
pub fn pick_action(rng: &mut impl Rng) -> IdleAction {
    match rng.gen_range(0u32..100) {
        0..=19 => IdleAction::MarkChatRead,
        20..=39 => IdleAction::PresenceToggle,
        40..=59 => IdleAction::TypeAndCancel,
        60..=69 => IdleAction::ViewStatus,
        70..=84 => IdleAction::SilentVoiceNote,
        _ => IdleAction::Idle,
    }
}

/// Perform one idle action over a live connection. `peers` are the other
/// identities co-located on this worker (voice-note targets). Actions that
/// need a target but have none degrade to idling.
pub async fn perform(
    action: IdleAction,
    conn: &dyn Connection,
    peers: &[String],
    pause: PauseRange,
) -> Result<()> {
    let (contact, peer, pause_ms, seconds) = {
        let mut rng = rand::thread_rng();
        (
            conn.contacts().choose(&mut rng).cloned(),
            peers.choose(&mut rng).cloned(),
            pause.sample(&mut rng),
            rng.gen_range(1u32..=3),
        )
    };

    match action {
        IdleAction::MarkChatRead => {
            if let Some(chat) = contact {
                conn.mark_read(&chat).await?;
            }
        }
        IdleAction::PresenceToggle => {
            conn.set_presence(true).await?;
            tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;
            conn.set_presence(false).await?;
        }
        IdleAction::TypeAndCancel => {
            if let Some(chat) = contact {
                conn.typing(&chat, true).await?;
                tokio::time::sleep(std::time::Duration::from_millis(pause_ms)).await;
                conn.typing(&chat, false).await?;
            }
        }
        IdleAction::ViewStatus => {
            if let Some(contact) = contact {
                conn.view_status(&contact).await?;
            }
        }
        IdleAction::SilentVoiceNote => {
            if let Some(peer) = peer {
                conn.send_voice_note(&peer, seconds).await?;
            }
        }
        IdleAction::Idle => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_chatwire::fake::FakeService;
    use dr_chatwire::proxy::direct;
    use dr_chatwire::{DialOutcome, Dialer};

    #[test]
    fn wake_interval_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let ms = next_wake_ms(&mut rng);
            assert!((900_000..=2_700_000).contains(&ms));
        }
    }

    #[test]
    fn action_distribution_roughly_matches_weights() {
        let mut rng = rand::thread_rng();
        let mut counts = std::collections::HashMap::new();
        let n = 20_000;
        for _ in 0..n {
            *counts.entry(pick_action(&mut rng)).or_insert(0u32) += 1;
        }
        let share = |a: IdleAction| *counts.get(&a).unwrap_or(&0) as f64 / n as f64;
        assert!((share(IdleAction::MarkChatRead) - 0.20).abs() < 0.03);
        assert!((share(IdleAction::PresenceToggle) - 0.20).abs() < 0.03);
        assert!((share(IdleAction::TypeAndCancel) - 0.20).abs() < 0.03);
        assert!((share(IdleAction::ViewStatus) - 0.10).abs() < 0.03);
        assert!((share(IdleAction::SilentVoiceNote) - 0.15).abs() < 0.03);
        assert!((share(IdleAction::Idle) - 0.15).abs() < 0.03);
    }

    #[tokio::test]
    async fn voice_note_targets_a_co_located_peer() {
        let svc = FakeService::new();
        let cred = svc.pair("+1555");
        let conn = match svc.dial("+1555", Some(&cred), &direct()).await.unwrap() {
            DialOutcome::Connected(c) => c,
            _ => unreachable!(),
        };
        let peers = vec!["+1666".to_owned()];
        let pause = PauseRange { min_ms: 0, max_ms: 0 };

        perform(IdleAction::SilentVoiceNote, conn.as_ref(), &peers, pause)
            .await
            .unwrap();

        let sent = svc.delivered();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].voice_note);
        assert_eq!(sent[0].to, "+1666");
    }

    #[tokio::test]
    async fn target_actions_degrade_to_idle_without_contacts() {
        let svc = FakeService::new();
        let cred = svc.pair("+1555");
        let conn = match svc.dial("+1555", Some(&cred), &direct()).await.unwrap() {
            DialOutcome::Connected(c) => c,
            _ => unreachable!(),
        };
        let pause = PauseRange { min_ms: 0, max_ms: 0 };
        // No contacts, no peers: nothing to do, nothing to fail.
        perform(IdleAction::MarkChatRead, conn.as_ref(), &[], pause)
            .await
            .unwrap();
        perform(IdleAction::SilentVoiceNote, conn.as_ref(), &[], pause)
            .await
            .unwrap();
        assert!(svc.delivered().is_empty());
    }
}
