//! State reporting.
//!
//! After the connection comes up the client reports its own entity to the
//! server on a fixed cadence: once after an initial delay, then every
//! period. The schedule is tick driven; callers feed elapsed time through
//! [`StateReporter::advance`].

use std::time::Duration;

use cube_shared::net::{EntitySnapshot, Message};

/// Periodic timer for outbound `PlayerUpdate`s.
#[derive(Debug, Clone)]
pub struct StateReporter {
    delay: Duration,
    period: Duration,
    /// Time accumulated toward the next fire. `None` until started.
    elapsed: Option<Duration>,
    fires: u64,
}

impl StateReporter {
    pub fn new(delay: Duration, period: Duration) -> Self {
        Self {
            delay,
            period,
            elapsed: None,
            fires: 0,
        }
    }

    /// Arms the timer. Called on the Connect event; later calls are ignored.
    pub fn start(&mut self) {
        if self.elapsed.is_none() {
            self.elapsed = Some(Duration::ZERO);
        }
    }

    pub fn is_started(&self) -> bool {
        self.elapsed.is_some()
    }

    pub fn fires(&self) -> u64 {
        self.fires
    }

    /// Advances the timer by `dt`; returns whether a report is due now.
    ///
    /// Fires at most once per call. Periods missed during a long tick are
    /// dropped rather than replayed.
    pub fn advance(&mut self, dt: Duration) -> bool {
        let Some(elapsed) = self.elapsed.as_mut() else {
            return false;
        };
        *elapsed += dt;

        let due = if self.fires == 0 { self.delay } else { self.period };
        if *elapsed < due {
            return false;
        }

        let rest = *elapsed - due;
        *elapsed = if rest >= self.period {
            wrap(rest, self.period)
        } else {
            rest
        };
        self.fires += 1;
        true
    }
}

fn wrap(d: Duration, period: Duration) -> Duration {
    if period.is_zero() {
        return Duration::ZERO;
    }
    let nanos = d.as_nanos() % period.as_nanos();
    Duration::from_nanos(nanos as u64)
}

/// Builds the outbound report for the local entity.
pub fn build_report(local: EntitySnapshot) -> Message {
    Message::player_update(local)
}

#[cfg(test)]
mod tests {
    use cube_shared::{
        math::{Color, Vec3},
        net::Command,
    };

    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn reporter() -> StateReporter {
        StateReporter::new(Duration::from_millis(100), Duration::from_millis(16))
    }

    #[test]
    fn silent_until_started() {
        let mut r = reporter();
        assert!(!r.advance(Duration::from_secs(10)));
        assert!(!r.is_started());
        assert_eq!(r.fires(), 0);
    }

    #[test]
    fn first_fire_after_delay_then_every_period() {
        let mut r = reporter();
        r.start();
        assert!(!r.advance(Duration::from_millis(99)));
        assert!(r.advance(MS));

        let mut ticks = Vec::new();
        for tick in 1..=64 {
            if r.advance(MS) {
                ticks.push(tick);
            }
        }
        assert_eq!(ticks, vec![16, 32, 48, 64]);
    }

    #[test]
    fn long_tick_fires_once() {
        let mut r = reporter();
        r.start();
        assert!(r.advance(Duration::from_millis(100)));
        assert!(r.advance(Duration::from_millis(50)));
        assert_eq!(r.fires(), 2);
        // 34ms left over wraps to 2ms toward the next period.
        assert!(!r.advance(Duration::from_millis(13)));
        assert!(r.advance(MS));
    }

    #[test]
    fn restart_does_not_reset_schedule() {
        let mut r = reporter();
        r.start();
        r.advance(Duration::from_millis(60));
        r.start();
        assert!(r.advance(Duration::from_millis(40)));
    }

    #[test]
    fn report_is_a_player_update() {
        let msg = build_report(EntitySnapshot::new("p1", Vec3::ZERO, Color::RED));
        assert_eq!(msg.command(), Command::PlayerUpdate);
    }
}
