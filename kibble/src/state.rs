//! The device-state hub: the single piece of shared mutable state every
//! task reads a consistent snapshot of, plus the command inbox and the
//! topic-keyed event bus fed from it.
//!
//! Every accessor that needs the lock copies what it needs out and drops
//! the guard before doing any I/O or `.await`ing anything else - the
//! "copy-out-then-act" rule the safety supervisor and dispensing engine
//! both depend on to keep the hub > bridge > scale acquisition order from
//! ever deadlocking (spec section 5).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use crate::error::Error;
use crate::messages::control::command::FeedCommand;
use crate::messages::control::event::{Event, Topic};
use crate::utils::record::TankInfo;

const BROADCAST_CAPACITY: usize = 64;

/// Current feeding status, published on the `StatusChanged` topic whenever
/// it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedingStatus {
    Idle,
    Processing,
    Error,
}

impl FeedingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedingStatus::Idle => "Idle",
            FeedingStatus::Processing => "Processing...",
            FeedingStatus::Error => "Error",
        }
    }
}

/// Everything the hub holds behind its single mutex.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub tanks: Vec<TankInfo>,
    pub current_weight_g: f32,
    pub current_raw: i32,
    pub weight_stable: bool,
    pub scale_responding: bool,
    pub feeding_status: FeedingStatus,
    /// Invariant I5: once set, the safety flag is sticky until an explicit
    /// clear; while set, the feed dispatcher rejects every non-stop
    /// command.
    pub safety_mode_engaged: bool,
    pub last_event: Option<String>,
    /// The most recent command the dispatcher has claimed from the inbox,
    /// with `processed` forced true - the external observation point for
    /// P8's "processed == true observable after each command" property,
    /// since the inbox itself goes back to empty the instant a command is
    /// claimed.
    pub last_command: Option<FeedCommand>,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState {
            tanks: Vec::new(),
            current_weight_g: 0.0,
            current_raw: 0,
            weight_stable: false,
            scale_responding: false,
            feeding_status: FeedingStatus::Idle,
            safety_mode_engaged: false,
            last_event: None,
            last_command: None,
        }
    }
}

pub struct DeviceStateHub {
    state: Mutex<DeviceState>,
    inbox: Mutex<Option<FeedCommand>>,
    lock_timeout: Duration,
    topics: HashMap<Topic, broadcast::Sender<Event>>,
}

impl DeviceStateHub {
    pub fn new(lock_timeout: Duration) -> Self {
        let topics = [
            Topic::TanksChanged,
            Topic::Weight,
            Topic::StatusChanged,
            Topic::FeedingProgress,
            Topic::FeedingComplete,
            Topic::Error,
        ]
        .into_iter()
        .map(|topic| (topic, broadcast::channel(BROADCAST_CAPACITY).0))
        .collect();

        DeviceStateHub {
            state: Mutex::new(DeviceState::default()),
            inbox: Mutex::new(None),
            lock_timeout,
            topics,
        }
    }

    /// Subscribes to a topic. Late subscribers miss whatever was published
    /// before they subscribed, by design - a fresh subscriber should call
    /// [`Self::snapshot`] first rather than rely on replay.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.topics[&topic].subscribe()
    }

    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        // A send with no subscribers is not an error - it just means
        // nobody's listening on that topic right now.
        let _ = self.topics[&topic].send(event);
    }

    async fn lock_state(&self) -> Result<tokio::sync::MutexGuard<'_, DeviceState>, Error> {
        timeout(self.lock_timeout, self.state.lock())
            .await
            .map_err(|_| Error::LockTimeout("hub", self.lock_timeout))
    }

    /// Copies out the current state. Cheap enough (the tank list tops out
    /// at six entries) to call freely instead of holding the lock across
    /// other work.
    pub async fn snapshot(&self) -> Result<DeviceState, Error> {
        Ok(self.lock_state().await?.clone())
    }

    /// Replaces the connected-tanks mirror. The registry is the sole
    /// writer of the canonical list; this only ever transactionally
    /// refreshes the hub's copy (spec section 5's "shared mutation" rule).
    /// Fires `TanksChanged` only when the UID set actually differs from
    /// what was already mirrored.
    pub async fn set_tanks(&self, tanks: Vec<TankInfo>) -> Result<bool, Error> {
        let changed = {
            let mut guard = self.lock_state().await?;
            let changed = {
                let mut before: Vec<u64> = guard.tanks.iter().map(|t| t.uid).collect();
                let mut after: Vec<u64> = tanks.iter().map(|t| t.uid).collect();
                before.sort_unstable();
                after.sort_unstable();
                before != after
            };
            guard.tanks = tanks;
            changed
        };
        if changed {
            self.publish(Event::TanksChanged);
        }
        Ok(changed)
    }

    pub async fn set_weight(&self, grams: f32, raw: i32, stable: bool, responding: bool) -> Result<(), Error> {
        {
            let mut guard = self.lock_state().await?;
            guard.current_weight_g = grams;
            guard.current_raw = raw;
            guard.weight_stable = stable;
            guard.scale_responding = responding;
        }
        self.publish(Event::Weight { weight: grams, raw });
        Ok(())
    }

    pub async fn set_feeding_status(&self, status: FeedingStatus) -> Result<(), Error> {
        let changed = {
            let mut guard = self.lock_state().await?;
            let changed = guard.feeding_status != status;
            guard.feeding_status = status;
            changed
        };
        if changed {
            self.publish(Event::StatusChanged { state: status.as_str().into() });
        }
        Ok(())
    }

    pub async fn set_last_event(&self, event: impl Into<String>) -> Result<(), Error> {
        let mut guard = self.lock_state().await?;
        guard.last_event = Some(event.into());
        Ok(())
    }

    /// Latches the safety flag. Sticky by design: only
    /// [`Self::clear_safety_latch`] can release it, never an ordinary
    /// state update.
    pub async fn latch_safety(&self, last_event: impl Into<String>) -> Result<(), Error> {
        let last_event = last_event.into();
        {
            let mut guard = self.lock_state().await?;
            guard.safety_mode_engaged = true;
            guard.feeding_status = FeedingStatus::Error;
            guard.last_event = Some(last_event.clone());
        }
        self.publish(Event::StatusChanged { state: FeedingStatus::Error.as_str().into() });
        self.publish(Event::Error { code: last_event.clone(), message: format!("safety latched: {last_event}") });
        Ok(())
    }

    pub async fn clear_safety_latch(&self) -> Result<(), Error> {
        {
            let mut guard = self.lock_state().await?;
            guard.safety_mode_engaged = false;
            guard.feeding_status = FeedingStatus::Idle;
        }
        self.publish(Event::StatusChanged { state: FeedingStatus::Idle.as_str().into() });
        Ok(())
    }

    /// Places a command in the inbox. Rejects non-stop commands outright
    /// while the safety flag is engaged (invariant I5), and rejects the
    /// request if one is already pending rather than queueing - callers
    /// that want queueing build it above this layer.
    pub async fn submit_command(&self, command: FeedCommand) -> Result<(), Error> {
        if !command.is_stop() && self.snapshot().await?.safety_mode_engaged {
            return Err(Error::SafetyLatched("feed command rejected while safety mode is engaged".into()));
        }
        let mut guard = timeout(self.lock_timeout, self.inbox.lock())
            .await
            .map_err(|_| Error::LockTimeout("hub-inbox", self.lock_timeout))?;
        if guard.is_some() {
            return Err(Error::DispensingAborted("a feed command is already pending".into()));
        }
        *guard = Some(command);
        Ok(())
    }

    /// Takes the pending command, if any, leaving the inbox empty. Called
    /// by the feed dispatcher's consumer loop (spec section 5's ordering
    /// guarantee O2: commands are observed in the order placed since the
    /// inbox holds at most one at a time). Marks the claimed command
    /// processed and mirrors it into `last_command` before returning it, so
    /// a caller polling `snapshot` sees `processed == true` the instant the
    /// dispatcher picks the command up, not only once the feed completes.
    pub async fn take_command(&self) -> Result<Option<FeedCommand>, Error> {
        let taken = {
            let mut guard = timeout(self.lock_timeout, self.inbox.lock())
                .await
                .map_err(|_| Error::LockTimeout("hub-inbox", self.lock_timeout))?;
            guard.take()
        };
        let Some(mut command) = taken else {
            return Ok(None);
        };
        command.processed = true;
        self.lock_state().await?.last_command = Some(command);
        Ok(Some(command))
    }

    /// Consumes a pending `EmergencyStop`, leaving any other command in
    /// place. The dispensing engine polls this between phases and inside
    /// every inner wait loop (spec section 4.6) so a stop can preempt a
    /// feed in progress without waiting for the feed's own command to be
    /// claimed by the dispatcher first.
    pub async fn try_take_emergency_stop(&self) -> Result<bool, Error> {
        let mut guard = timeout(self.lock_timeout, self.inbox.lock())
            .await
            .map_err(|_| Error::LockTimeout("hub-inbox", self.lock_timeout))?;
        if matches!(guard.as_ref(), Some(cmd) if cmd.is_stop()) {
            guard.take();
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::control::command::{FeedCommand, FeedCommandKind};

    fn hub() -> DeviceStateHub {
        DeviceStateHub::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn safety_latch_is_sticky_until_explicitly_cleared() {
        let hub = hub();
        hub.latch_safety("overfill").await.unwrap();
        let snap = hub.snapshot().await.unwrap();
        assert!(snap.safety_mode_engaged);
        assert_eq!(snap.feeding_status, FeedingStatus::Error);

        hub.clear_safety_latch().await.unwrap();
        let snap = hub.snapshot().await.unwrap();
        assert!(!snap.safety_mode_engaged);
    }

    #[tokio::test]
    async fn second_command_is_rejected_while_one_is_pending() {
        let hub = hub();
        let cmd = FeedCommand::immediate(1, 50.0);
        hub.submit_command(cmd).await.unwrap();
        let second = hub.submit_command(cmd).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn non_stop_commands_are_rejected_while_safety_is_engaged() {
        let hub = hub();
        hub.latch_safety("motor_stall").await.unwrap();
        let result = hub.submit_command(FeedCommand::immediate(1, 50.0)).await;
        assert!(matches!(result, Err(Error::SafetyLatched(_))));
    }

    #[tokio::test]
    async fn emergency_stop_is_accepted_even_while_safety_is_engaged() {
        let hub = hub();
        hub.latch_safety("motor_stall").await.unwrap();
        let result = hub.submit_command(FeedCommand::emergency_stop()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn take_command_empties_the_inbox() {
        let hub = hub();
        let cmd = FeedCommand::immediate(1, 50.0);
        hub.submit_command(cmd).await.unwrap();
        let taken = hub.take_command().await.unwrap();
        assert_eq!(taken.map(|c| c.kind), Some(cmd.kind));
        assert_eq!(hub.take_command().await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_command_marks_the_claimed_command_processed_and_observable() {
        let hub = hub();
        let cmd = FeedCommand::immediate(1, 50.0);
        assert!(!cmd.processed);
        hub.submit_command(cmd).await.unwrap();

        let taken = hub.take_command().await.unwrap().unwrap();
        assert!(taken.processed);

        let snap = hub.snapshot().await.unwrap();
        assert_eq!(snap.last_command.map(|c| c.processed), Some(true));
    }

    #[tokio::test]
    async fn a_sequence_of_commands_is_each_observed_processed_in_order() {
        let hub = hub();
        for uid in [1u64, 2, 3] {
            hub.submit_command(FeedCommand::immediate(uid, 10.0)).await.unwrap();
            let taken = hub.take_command().await.unwrap().unwrap();
            assert!(taken.processed);
            assert_eq!(taken.kind, FeedCommandKind::Immediate { tank_uid: uid, grams: 10.0 });
            let snap = hub.snapshot().await.unwrap();
            assert_eq!(snap.last_command.map(|c| c.kind), Some(taken.kind));
        }
    }

    #[tokio::test]
    async fn set_tanks_reports_whether_the_uid_set_changed() {
        let hub = hub();
        let changed = hub.set_tanks(vec![TankInfo::witness(1, 0)]).await.unwrap();
        assert!(changed);
        let unchanged = hub.set_tanks(vec![TankInfo::witness(1, 0)]).await.unwrap();
        assert!(!unchanged);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let hub = hub();
        let mut rx = hub.subscribe(Topic::StatusChanged);
        hub.publish(Event::StatusChanged { state: "idle".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), Topic::StatusChanged);
    }
}
