//! Stream watchdog.
//!
//! Each tick feeds one probe result and one polled player state into a
//! small state machine:
//!
//! - `Healthy` → `Degraded` when the host is unreachable, the player reports
//!   `Error`/`Ended`/`Idle`, or it has been stuck in `Opening`/`Buffering` for
//!   [`MonitorSettings::frozen_after_ticks`] consecutive ticks.
//! - `Degraded` → `Reconnecting` right away (stop, then play the configured
//!   stream) when the [`ReconnectPolicy`] allows it.
//! - `Reconnecting` → `Healthy` once the probe passes and the player is
//!   `Playing`. Until then the sequence is left to settle: ticks that see the
//!   player still opening are no-ops, so reconnects never overlap. A terminal
//!   player state, or running out of [`MonitorSettings::settle_ticks`], ends
//!   the sequence and starts a new one.
//!
//! Nothing here is ever fatal and there is no retry limit: an unattended
//! monitor showing a frozen frame is worse than one reconnecting every few
//! seconds.

use crate::engine::MediaEngine;
use crate::player::{StreamPlayer, StreamTarget};
use crate::types::{HealthState, PlayerState};

/// Tunables for fault detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Consecutive `Opening`/`Buffering` ticks while healthy that count as a
    /// frozen stream. A single buffering tick is normal network jitter.
    pub frozen_after_ticks: u32,
    /// Ticks a reconnect gets to reach `Playing` before it is retried.
    pub settle_ticks: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            frozen_after_ticks: 2,
            settle_ticks: 3,
        }
    }
}

/// Why the stream was declared degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    Player(PlayerState),
    Frozen,
    /// A reconnect never reached `Playing` within the settle window.
    SettleTimeout,
}

impl Fault {
    pub fn describe(&self) -> String {
        match self {
            Fault::Unreachable => "NVR unreachable".to_string(),
            Fault::Player(state) => format!("player {:?}", state).to_lowercase(),
            Fault::Frozen => "stream frozen".to_string(),
            Fault::SettleTimeout => "reconnect timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Now,
    Hold,
}

/// Decides whether a reconnect may be issued. Swap this out to add backoff
/// without touching the state machine.
pub trait ReconnectPolicy: Send {
    /// `attempt` counts reconnects since the stream was last healthy, from 1.
    fn decide(&mut self, attempt: u32) -> ReconnectDecision;

    fn on_recovered(&mut self) {}
}

/// Reconnect immediately, every time, forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnboundedRetry;

impl ReconnectPolicy for UnboundedRetry {
    fn decide(&mut self, _attempt: u32) -> ReconnectDecision {
        ReconnectDecision::Now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Healthy and staying that way.
    Steady,
    /// Reconnect in flight, left alone this tick.
    Settling,
    /// Reconnect succeeded.
    Recovered,
    /// Stop and play were issued.
    Reconnected { fault: Fault, attempt: u32 },
    /// Fault seen, but the policy held the reconnect back.
    Held { fault: Fault },
}

/// What one tick did. `path` lists every state passed through, starting
/// with the state the tick began in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub path: Vec<HealthState>,
    pub player: PlayerState,
    pub reachable: bool,
    pub action: TickAction,
}

impl TickReport {
    pub fn end_state(&self) -> HealthState {
        self.path.last().copied().unwrap_or(HealthState::Healthy)
    }
}

pub struct HealthMonitor {
    state: HealthState,
    settings: MonitorSettings,
    policy: Box<dyn ReconnectPolicy>,
    stalled_ticks: u32,
    settling_ticks: u32,
    attempts: u32,
    last_fault: Option<Fault>,
}

impl HealthMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self::with_policy(settings, Box::new(UnboundedRetry))
    }

    pub fn with_policy(settings: MonitorSettings, policy: Box<dyn ReconnectPolicy>) -> Self {
        Self {
            state: HealthState::Healthy,
            settings,
            policy,
            stalled_ticks: 0,
            settling_ticks: 0,
            attempts: 0,
            last_fault: None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn last_fault(&self) -> Option<Fault> {
        self.last_fault
    }

    /// A reconnect was issued outside the watchdog (startup, manual refresh).
    /// Treat it as in flight so the next ticks wait for it.
    pub fn note_external_reconnect(&mut self) {
        self.state = HealthState::Reconnecting;
        self.settling_ticks = 0;
        self.stalled_ticks = 0;
    }

    /// Run one watchdog tick against the player.
    pub fn tick<E: MediaEngine>(
        &mut self,
        reachable: bool,
        player: &mut StreamPlayer<E>,
        target: &StreamTarget,
    ) -> TickReport {
        let player_state = player.state();
        let mut path = vec![self.state];

        let action = match self.state {
            HealthState::Reconnecting => {
                if reachable && player_state == PlayerState::Playing {
                    self.recover(&mut path)
                } else {
                    self.settling_ticks += 1;
                    let failed = player_state.is_terminal();
                    let expired = self.settling_ticks >= self.settings.settle_ticks;
                    if !failed && !expired {
                        log::debug!(
                            "Reconnect settling ({}/{}), player {:?}",
                            self.settling_ticks,
                            self.settings.settle_ticks,
                            player_state
                        );
                        TickAction::Settling
                    } else {
                        let fault = if !reachable {
                            Fault::Unreachable
                        } else if failed {
                            Fault::Player(player_state)
                        } else {
                            Fault::SettleTimeout
                        };
                        self.degrade(fault, &mut path, player, target)
                    }
                }
            }
            HealthState::Healthy | HealthState::Degraded => {
                match self.assess(reachable, player_state) {
                    None if self.state == HealthState::Degraded => self.recover(&mut path),
                    None => TickAction::Steady,
                    Some(fault) => self.degrade(fault, &mut path, player, target),
                }
            }
        };

        TickReport {
            path,
            player: player_state,
            reachable,
            action,
        }
    }

    /// Fault check for a stream that is supposed to be playing.
    fn assess(&mut self, reachable: bool, player_state: PlayerState) -> Option<Fault> {
        if player_state.is_stalled() {
            self.stalled_ticks += 1;
        } else {
            self.stalled_ticks = 0;
        }

        if !reachable {
            Some(Fault::Unreachable)
        } else if player_state.is_terminal() {
            Some(Fault::Player(player_state))
        } else if self.stalled_ticks >= self.settings.frozen_after_ticks {
            Some(Fault::Frozen)
        } else {
            None
        }
    }

    fn degrade<E: MediaEngine>(
        &mut self,
        fault: Fault,
        path: &mut Vec<HealthState>,
        player: &mut StreamPlayer<E>,
        target: &StreamTarget,
    ) -> TickAction {
        self.enter(HealthState::Degraded, path);
        self.last_fault = Some(fault);
        self.attempts += 1;

        match self.policy.decide(self.attempts) {
            ReconnectDecision::Now => {
                log::warn!(
                    "Stream degraded ({:?}), reconnecting (attempt {})",
                    fault,
                    self.attempts
                );
                self.enter(HealthState::Reconnecting, path);
                self.settling_ticks = 0;
                self.stalled_ticks = 0;

                player.stop();
                if let Err(e) = player.play_target(target) {
                    // Left in Reconnecting: the next tick sees the failure.
                    log::error!("Reconnect attempt {} failed to start: {}", self.attempts, e);
                }
                TickAction::Reconnected {
                    fault,
                    attempt: self.attempts,
                }
            }
            ReconnectDecision::Hold => {
                log::info!("Stream degraded ({:?}), reconnect held by policy", fault);
                TickAction::Held { fault }
            }
        }
    }

    fn recover(&mut self, path: &mut Vec<HealthState>) -> TickAction {
        if self.attempts > 0 {
            log::info!("Stream healthy again after {} reconnect(s)", self.attempts);
        } else {
            log::info!("Stream healthy");
        }
        self.enter(HealthState::Healthy, path);
        self.attempts = 0;
        self.stalled_ticks = 0;
        self.settling_ticks = 0;
        self.last_fault = None;
        self.policy.on_recovered();
        TickAction::Recovered
    }

    fn enter(&mut self, next: HealthState, path: &mut Vec<HealthState>) {
        if self.state != next {
            log::debug!("Health {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        path.push(next);
    }
}
