//! In-memory spam discipline per tenant user: bubble-chat superseding,
//! identical-text flood limits, sliding rate windows, and timed bans.
//!
//! State is process-local by design; a restart forgives in-flight bubbles
//! and active bans, which is the cheap and acceptable failure mode here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use govconnect_core::config::AppConfig;
use govconnect_core::events::ContextMessage;
use tracing::{debug, info, warn};

/// In-flight entries older than this are considered abandoned by the AI and
/// evicted by the GC sweep.
const IN_FLIGHT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// GC cadence.
pub const GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct SpamGuardConfig {
    pub enabled: bool,
    pub max_identical: u32,
    pub ban_duration: Duration,
    pub rate_max_messages: u32,
    pub rate_window: Duration,
}

impl SpamGuardConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            enabled: config.spam_guard_enabled,
            max_identical: config.spam_guard_max_identical,
            ban_duration: Duration::from_millis(config.spam_guard_ban_duration_ms),
            rate_max_messages: config.spam_rate_max_messages,
            rate_window: Duration::from_millis(config.spam_rate_window_ms),
        }
    }
}

/// Why a message was rejected; `remaining_ms` is surfaced so logs and
/// internal responses can state when the user recovers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    RateBanActive { remaining_ms: u64 },
    TextBanActive { remaining_ms: u64 },
    RateLimitExceeded { remaining_ms: u64 },
    IdenticalFlood { remaining_ms: u64 },
}

#[derive(Debug, Clone)]
pub enum SpamVerdict {
    /// Forward to the AI. When `supersede_previous` is set, the earlier
    /// in-flight messages must be completed in the pending queue and
    /// `context` carries the whole accumulated bubble.
    Process {
        supersede_previous: bool,
        suppressed_message_ids: Vec<String>,
        context: Vec<ContextMessage>,
    },
    Reject(RejectReason),
}

impl SpamVerdict {
    pub fn should_process(&self) -> bool {
        matches!(self, SpamVerdict::Process { .. })
    }
}

#[derive(Debug, Clone)]
struct InFlightMessage {
    message_id: String,
    text: String,
    received_at: Instant,
}

#[derive(Debug, Default)]
struct UserState {
    in_flight: Vec<InFlightMessage>,
    /// Identical-text counters scoped to the current bubble.
    identical_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone, Copy)]
struct Ban {
    expires_at: Instant,
}

impl Ban {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.checked_duration_since(now)
    }
}

#[derive(Default)]
struct GuardState {
    users: HashMap<String, UserState>,
    /// `village:user:normalized-text` → ban
    text_bans: HashMap<String, Ban>,
    /// `village:user` → ban
    rate_bans: HashMap<String, Ban>,
    /// `village:user` → recent receive instants inside the window
    rate_windows: HashMap<String, VecDeque<Instant>>,
}

pub struct SpamGuard {
    config: SpamGuardConfig,
    state: Mutex<GuardState>,
}

fn user_key(village_id: &str, user_id: &str) -> String {
    format!("{village_id}:{user_id}")
}

fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

impl SpamGuard {
    pub fn new(config: SpamGuardConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(GuardState::default()),
        })
    }

    /// Evaluate one inbound message. The checks run in a fixed order: active
    /// rate ban, active text ban, rate window, identical-count, then bubble
    /// accounting.
    pub fn check_message(
        &self,
        village_id: &str,
        user_id: &str,
        message_id: &str,
        text: &str,
    ) -> SpamVerdict {
        let now = Instant::now();
        let key = user_key(village_id, user_id);
        let normalized = normalize_text(text);
        let text_ban_key = format!("{key}:{normalized}");

        let mut state = self.state.lock().unwrap();

        if self.config.enabled {
            if let Some(ban) = state.rate_bans.get(&key) {
                if let Some(remaining) = ban.remaining(now) {
                    debug!(user = %key, "rate ban active");
                    return SpamVerdict::Reject(RejectReason::RateBanActive {
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
                state.rate_bans.remove(&key);
            }

            if let Some(ban) = state.text_bans.get(&text_ban_key) {
                if let Some(remaining) = ban.remaining(now) {
                    debug!(user = %key, "text ban active");
                    return SpamVerdict::Reject(RejectReason::TextBanActive {
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
                state.text_bans.remove(&text_ban_key);
            }

            let window = state.rate_windows.entry(key.clone()).or_default();
            window.push_back(now);
            while let Some(front) = window.front() {
                if now.duration_since(*front) > self.config.rate_window {
                    window.pop_front();
                } else {
                    break;
                }
            }
            if window.len() as u32 > self.config.rate_max_messages {
                let ban = Ban {
                    expires_at: now + self.config.ban_duration,
                };
                state.rate_bans.insert(key.clone(), ban);
                warn!(user = %key, "rate flood detected, banning");
                return SpamVerdict::Reject(RejectReason::RateLimitExceeded {
                    remaining_ms: self.config.ban_duration.as_millis() as u64,
                });
            }

            let user = state.users.entry(key.clone()).or_default();
            let count = user.identical_counts.entry(normalized.clone()).or_insert(0);
            *count += 1;
            if *count > self.config.max_identical {
                // Undo the counter so the ban window, not the counter,
                // gates recovery.
                *count -= 1;
                let ban = Ban {
                    expires_at: now + self.config.ban_duration,
                };
                state.text_bans.insert(text_ban_key, ban);
                warn!(user = %key, "identical-text flood detected, banning text");
                return SpamVerdict::Reject(RejectReason::IdenticalFlood {
                    remaining_ms: self.config.ban_duration.as_millis() as u64,
                });
            }
        }

        // A disabled guard skips the checks above but still tracks the
        // bubble so superseding keeps working.

        let user = state.users.entry(key).or_default();
        let previous: Vec<InFlightMessage> = user.in_flight.clone();
        user.in_flight.push(InFlightMessage {
            message_id: message_id.to_string(),
            text: text.to_string(),
            received_at: now,
        });

        let context: Vec<ContextMessage> = user
            .in_flight
            .iter()
            .map(|m| ContextMessage {
                message_id: m.message_id.clone(),
                text: m.text.clone(),
            })
            .collect();

        if previous.is_empty() {
            SpamVerdict::Process {
                supersede_previous: false,
                suppressed_message_ids: Vec::new(),
                context,
            }
        } else {
            SpamVerdict::Process {
                supersede_previous: true,
                suppressed_message_ids: previous
                    .iter()
                    .map(|m| m.message_id.clone())
                    .collect(),
                context,
            }
        }
    }

    /// A successful AI reply closes the bubble: the whole in-flight list and
    /// its identical counters are dropped.
    pub fn clear_in_flight(&self, village_id: &str, user_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.users.remove(&user_key(village_id, user_id)).is_some() {
            debug!(village_id, user_id, "bubble cleared");
        }
    }

    /// Takeover cancellation: drop the bubble and report which message ids
    /// were in flight so their pending rows can be completed.
    pub fn cancel_in_flight(&self, village_id: &str, user_id: &str) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state
            .users
            .remove(&user_key(village_id, user_id))
            .map(|user| {
                user.in_flight
                    .into_iter()
                    .map(|m| m.message_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Periodic sweep: stale in-flight entries, expired bans, empty windows.
    /// Holds the state lock for the duration, which is bounded by map size.
    pub fn gc(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        state.users.retain(|_, user| {
            user.in_flight
                .retain(|m| now.duration_since(m.received_at) < IN_FLIGHT_MAX_AGE);
            !user.in_flight.is_empty()
        });
        state.text_bans.retain(|_, ban| ban.remaining(now).is_some());
        state.rate_bans.retain(|_, ban| ban.remaining(now).is_some());
        state.rate_windows.retain(|_, window| {
            while let Some(front) = window.front() {
                if now.duration_since(*front) > self.config.rate_window {
                    window.pop_front();
                } else {
                    break;
                }
            }
            !window.is_empty()
        });
        debug!(
            users = state.users.len(),
            text_bans = state.text_bans.len(),
            rate_bans = state.rate_bans.len(),
            "spam guard gc pass"
        );
    }

    /// Spawn the 10-minute GC loop; the handle is aborted at shutdown.
    pub fn spawn_gc(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let guard = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                guard.gc();
            }
        })
    }
}

impl SpamVerdict {
    pub fn suppressed_ids(&self) -> &[String] {
        match self {
            SpamVerdict::Process {
                suppressed_message_ids,
                ..
            } => suppressed_message_ids,
            SpamVerdict::Reject(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ban_ms: u64, window_ms: u64) -> SpamGuardConfig {
        SpamGuardConfig {
            enabled: true,
            max_identical: 5,
            ban_duration: Duration::from_millis(ban_ms),
            rate_max_messages: 10,
            rate_window: Duration::from_millis(window_ms),
        }
    }

    fn guard() -> Arc<SpamGuard> {
        SpamGuard::new(config(60_000, 10_000))
    }

    #[test]
    fn first_message_opens_a_bubble() {
        let g = guard();
        let verdict = g.check_message("V1", "628111222333", "m1", "halo");
        match verdict {
            SpamVerdict::Process {
                supersede_previous,
                suppressed_message_ids,
                context,
            } => {
                assert!(!supersede_previous);
                assert!(suppressed_message_ids.is_empty());
                assert_eq!(context.len(), 1);
                assert_eq!(context[0].text, "halo");
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn second_message_supersedes_with_combined_context() {
        let g = guard();
        g.check_message("V1", "628111222333", "m1", "halo");
        let verdict = g.check_message("V1", "628111222333", "m2", "kamu siapa");
        match verdict {
            SpamVerdict::Process {
                supersede_previous,
                suppressed_message_ids,
                context,
            } => {
                assert!(supersede_previous);
                assert_eq!(suppressed_message_ids, vec!["m1".to_string()]);
                assert_eq!(context.len(), 2);
                assert_eq!(context[0].message_id, "m1");
                assert_eq!(context[1].message_id, "m2");
                assert_eq!(context[1].text, "kamu siapa");
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn reply_clears_bubble_and_next_message_starts_fresh() {
        let g = guard();
        g.check_message("V1", "u", "m1", "halo");
        g.check_message("V1", "u", "m2", "lagi");
        g.clear_in_flight("V1", "u");

        let verdict = g.check_message("V1", "u", "m3", "baru");
        match verdict {
            SpamVerdict::Process {
                supersede_previous, ..
            } => assert!(!supersede_previous),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn sixth_identical_text_installs_text_ban_but_other_text_passes() {
        let g = guard();
        for i in 0..5 {
            let verdict = g.check_message("V1", "u", &format!("m{i}"), "ping");
            assert!(verdict.should_process(), "message {i} should pass");
        }

        let sixth = g.check_message("V1", "u", "m5", "ping");
        assert!(matches!(
            sixth,
            SpamVerdict::Reject(RejectReason::IdenticalFlood { .. })
        ));

        // Same text is now banned outright.
        let seventh = g.check_message("V1", "u", "m6", "PING  ");
        assert!(matches!(
            seventh,
            SpamVerdict::Reject(RejectReason::TextBanActive { .. })
        ));

        // A distinct text is still accepted during the ban.
        let help = g.check_message("V1", "u", "m7", "help");
        assert!(help.should_process());
    }

    #[test]
    fn eleventh_message_in_window_installs_rate_ban() {
        let g = guard();
        for i in 0..10 {
            let verdict = g.check_message("V1", "u", &format!("m{i}"), &format!("text {i}"));
            assert!(verdict.should_process(), "message {i} should pass");
        }

        let eleventh = g.check_message("V1", "u", "m10", "text 10");
        assert!(matches!(
            eleventh,
            SpamVerdict::Reject(RejectReason::RateLimitExceeded { .. })
        ));

        // Everything is rejected while the rate ban holds, even new text.
        let twelfth = g.check_message("V1", "u", "m11", "completely new");
        assert!(matches!(
            twelfth,
            SpamVerdict::Reject(RejectReason::RateBanActive { .. })
        ));
    }

    #[test]
    fn bans_expire() {
        let g = SpamGuard::new(SpamGuardConfig {
            ban_duration: Duration::from_millis(30),
            rate_window: Duration::from_millis(50),
            rate_max_messages: 2,
            ..config(30, 50)
        });

        for i in 0..2 {
            assert!(g
                .check_message("V1", "u", &format!("m{i}"), &format!("t{i}"))
                .should_process());
        }
        assert!(!g.check_message("V1", "u", "m2", "t2").should_process());

        std::thread::sleep(Duration::from_millis(80));
        // Ban expired and the window drained.
        assert!(g.check_message("V1", "u", "m3", "t3").should_process());
    }

    #[test]
    fn users_are_isolated_per_village() {
        let g = guard();
        g.check_message("V1", "u", "m1", "halo");
        let verdict = g.check_message("V2", "u", "m2", "halo");
        match verdict {
            SpamVerdict::Process {
                supersede_previous, ..
            } => assert!(!supersede_previous),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn cancel_reports_in_flight_ids() {
        let g = guard();
        g.check_message("V1", "u", "m1", "a");
        g.check_message("V1", "u", "m2", "b");
        let cancelled = g.cancel_in_flight("V1", "u");
        assert_eq!(cancelled, vec!["m1".to_string(), "m2".to_string()]);
        assert!(g.cancel_in_flight("V1", "u").is_empty());
    }

    #[test]
    fn gc_evicts_expired_bans_and_empty_windows() {
        let g = SpamGuard::new(SpamGuardConfig {
            ban_duration: Duration::from_millis(10),
            rate_window: Duration::from_millis(10),
            rate_max_messages: 1,
            ..config(10, 10)
        });
        assert!(g.check_message("V1", "u", "m1", "a").should_process());
        assert!(!g.check_message("V1", "u", "m2", "b").should_process());

        std::thread::sleep(Duration::from_millis(30));
        g.gc();

        let state = g.state.lock().unwrap();
        assert!(state.rate_bans.is_empty());
        assert!(state.rate_windows.is_empty());
    }
}
