//! Sliding-window bound on automatic restarts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart; `attempt` counts crashes inside the current window
    Restart { attempt: usize },
    /// Too many crashes inside the window
    GiveUp { crashes: usize },
}

#[derive(Debug)]
pub struct RestartTracker {
    max_restarts: usize,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts: max_restarts as usize,
            window,
            recent: VecDeque::new(),
        }
    }

    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        self.recent.push_back(now);

        if self.recent.len() > self.max_restarts {
            RestartDecision::GiveUp {
                crashes: self.recent.len(),
            }
        } else {
            RestartDecision::Restart {
                attempt: self.recent.len(),
            }
        }
    }

    pub fn max_restarts(&self) -> usize {
        self.max_restarts
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
