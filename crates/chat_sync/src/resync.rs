use crate::live_channel::ChannelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    AppStateChanged(AppState),
    ScreenFocused { screen: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPlan {
    pub refetch: bool,
    pub resubscribe: bool,
}

/// Decides when app resume or screen focus forces a full resync. Only one
/// resync runs at a time; triggers arriving meanwhile are dropped.
#[derive(Debug)]
pub struct ForegroundResynchronizer {
    app_state: AppState,
    in_flight: bool,
    /// A trigger arrived while a resync was running.
    rerun: bool,
}

impl Default for ForegroundResynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ForegroundResynchronizer {
    pub fn new() -> Self {
        Self {
            app_state: AppState::Active,
            in_flight: false,
            rerun: false,
        }
    }

    pub fn app_state(&self) -> AppState {
        self.app_state
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Records `event` and returns the plan to run, if any. A returned plan
    /// marks a resync in flight until [`Self::finish`] is called.
    pub fn observe(&mut self, event: &LifecycleEvent, live: ChannelState) -> Option<ResyncPlan> {
        let triggered = match event {
            LifecycleEvent::AppStateChanged(next) => {
                let resumed = *next == AppState::Active && self.app_state != AppState::Active;
                self.app_state = *next;
                resumed
            }
            LifecycleEvent::ScreenFocused { .. } => self.app_state == AppState::Active,
        };

        if !triggered {
            return None;
        }
        if self.in_flight {
            self.rerun = true;
            return None;
        }
        self.in_flight = true;
        Some(plan_for(live))
    }

    /// Ends the running resync. Triggers that arrived meanwhile collapse into
    /// one follow-up plan, which keeps the resync in flight.
    pub fn finish(&mut self, live: ChannelState) -> Option<ResyncPlan> {
        if std::mem::take(&mut self.rerun) {
            return Some(plan_for(live));
        }
        self.in_flight = false;
        None
    }

    /// Drops any running resync and pending follow-up.
    pub fn reset(&mut self) {
        self.in_flight = false;
        self.rerun = false;
    }
}

fn plan_for(live: ChannelState) -> ResyncPlan {
    ResyncPlan {
        refetch: true,
        resubscribe: !matches!(live, ChannelState::Subscribed | ChannelState::Subscribing),
    }
}
