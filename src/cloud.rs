//! Cloud registration and heartbeat.
//!
//! A 1s driver walks every known instance:
//! - disconnected and past `register_after` -> register (encrypted stats);
//!   success opens a channel, failure backs off a fixed 10s;
//! - connected and past `send_stats_after` -> report stats on the channel;
//!   success schedules the next report in 5s, failure drops the link and
//!   schedules a re-registration in 10s.
//!
//! Connection state is owned here; others get read-only copies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Result, ShimError};
use crate::instance::InstanceManager;
use crate::protocol::{self, SecureMessaging};
use crate::sys::traits::{CloudTransport, StatsSource};

pub const REGISTER_BACKOFF_MS: i64 = 10_000;
pub const STATS_INTERVAL_MS: i64 = 5_000;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub cores: usize,
    pub usage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub ram: UsageStats,
    pub disk: UsageStats,
    pub heap: UsageStats,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkPhase {
    #[default]
    Unregistered,
    Registering,
    Registered,
    /// Registered with a stats report in flight.
    Reporting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub channel: String,
    pub register_after: i64,
    pub send_stats_after: i64,
    pub phase: LinkPhase,
}

#[derive(Debug, Deserialize)]
struct RegisterReply {
    channel: String,
}

enum Action {
    Register,
    SendStats { channel: String },
}

enum Outcome {
    Registered(String),
    RegisterFailed(ShimError),
    StatsSent,
    StatsFailed(ShimError),
}

pub struct Heartbeat {
    instances: Arc<InstanceManager>,
    messaging: Arc<SecureMessaging>,
    transport: Arc<dyn CloudTransport>,
    stats: Arc<dyn StatsSource>,
    connections: Mutex<HashMap<String, ConnectionState>>,
    shutdown: Arc<Notify>,
}

impl Heartbeat {
    pub fn new(
        instances: Arc<InstanceManager>,
        messaging: Arc<SecureMessaging>,
        transport: Arc<dyn CloudTransport>,
        stats: Arc<dyn StatsSource>,
    ) -> Self {
        Self {
            instances,
            messaging,
            transport,
            stats,
            connections: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn connection(&self, instance_id: &str) -> Option<ConnectionState> {
        self.connections.lock().await.get(instance_id).cloned()
    }

    pub async fn run(&self) {
        info!(interval_ms = TICK_INTERVAL.as_millis() as u64, "Cloud heartbeat started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cloud heartbeat received shutdown signal");
                    break;
                }

                _ = ticker.tick() => self.tick_at(protocol::now_ms()).await,
            }
        }
    }

    /// One driver pass evaluated at `now` (ms).
    pub async fn tick_at(&self, now: i64) {
        let live: Vec<String> = self
            .instances
            .find_all()
            .await
            .into_iter()
            .map(|instance| instance.id)
            .collect();

        let actions = {
            let mut connections = self.connections.lock().await;
            // Removed instances lose their timers here.
            connections.retain(|id, _| live.contains(id));

            let mut actions = Vec::new();
            for id in &live {
                let state = connections.entry(id.clone()).or_default();
                match state.phase {
                    LinkPhase::Unregistered if state.register_after <= now => {
                        state.phase = LinkPhase::Registering;
                        actions.push((id.clone(), Action::Register));
                    }
                    LinkPhase::Registered if state.send_stats_after <= now => {
                        state.phase = LinkPhase::Reporting;
                        actions.push((id.clone(), Action::SendStats { channel: state.channel.clone() }));
                    }
                    _ => {}
                }
            }
            actions
        };
        if actions.is_empty() {
            return;
        }

        let outcomes = match self.stats.sample().await {
            Ok(stats) => self.execute(actions, stats).await,
            Err(e) => {
                warn!(error = %e, "Failed to sample system stats");
                actions
                    .into_iter()
                    .map(|(id, action)| {
                        let err = ShimError::Connectivity("stats unavailable".to_string());
                        let outcome = match action {
                            Action::Register => Outcome::RegisterFailed(err),
                            Action::SendStats { .. } => Outcome::StatsFailed(err),
                        };
                        (id, outcome)
                    })
                    .collect()
            }
        };

        let mut connections = self.connections.lock().await;
        for (id, outcome) in outcomes {
            let Some(state) = connections.get_mut(&id) else {
                continue;
            };
            apply_outcome(&id, state, outcome, now);
        }
    }

    /// Runs every action concurrently so one slow instance never holds up the rest.
    async fn execute(&self, actions: Vec<(String, Action)>, stats: SystemStats) -> Vec<(String, Outcome)> {
        let mut set = JoinSet::new();
        for (id, action) in actions {
            let messaging = self.messaging.clone();
            let transport = self.transport.clone();
            let stats = stats.clone();
            set.spawn(async move {
                let outcome = match action {
                    Action::Register => match register(&messaging, transport.as_ref(), &id, &stats).await {
                        Ok(channel) => Outcome::Registered(channel),
                        Err(e) => Outcome::RegisterFailed(e),
                    },
                    Action::SendStats { channel } => {
                        match send_stats(&messaging, transport.as_ref(), &id, &channel, &stats).await {
                            Ok(()) => Outcome::StatsSent,
                            Err(e) => Outcome::StatsFailed(e),
                        }
                    }
                };
                (id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Heartbeat task aborted"),
            }
        }
        outcomes
    }
}

async fn register(
    messaging: &SecureMessaging,
    transport: &dyn CloudTransport,
    instance_id: &str,
    stats: &SystemStats,
) -> Result<String> {
    let body = messaging.encode_as(instance_id, stats).await?;
    let reply = transport.register(instance_id, &body).await?;
    let reply: RegisterReply = messaging.decode_as(instance_id, &reply).await?;
    Ok(reply.channel)
}

async fn send_stats(
    messaging: &SecureMessaging,
    transport: &dyn CloudTransport,
    instance_id: &str,
    channel: &str,
    stats: &SystemStats,
) -> Result<()> {
    let body = messaging.encode_as(instance_id, stats).await?;
    transport.send_stats(instance_id, channel, &body).await
}

fn apply_outcome(instance_id: &str, state: &mut ConnectionState, outcome: Outcome, now: i64) {
    match outcome {
        Outcome::Registered(channel) => {
            info!(instance_id = %instance_id, "Registered with cloud");
            state.connected = true;
            state.channel = channel;
            state.send_stats_after = now;
            state.phase = LinkPhase::Registered;
        }
        Outcome::RegisterFailed(e) => {
            warn!(instance_id = %instance_id, error = %e, "Cloud registration failed, retrying in 10s");
            disconnect(state, now);
        }
        Outcome::StatsSent => {
            debug!(instance_id = %instance_id, "Stats delivered");
            state.send_stats_after = now + STATS_INTERVAL_MS;
            state.phase = LinkPhase::Registered;
        }
        Outcome::StatsFailed(e) => {
            warn!(instance_id = %instance_id, error = %e, "Stats delivery failed, dropping link");
            disconnect(state, now);
        }
    }
}

fn disconnect(state: &mut ConnectionState, now: i64) {
    state.connected = false;
    state.channel.clear();
    state.register_after = now + REGISTER_BACKOFF_MS;
    state.phase = LinkPhase::Unregistered;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShimConfig;
    use crate::protocol::{Envelope, KeySlot};
    use crate::sys::mock::MockRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedStats;

    #[async_trait]
    impl StatsSource for FixedStats {
        async fn sample(&self) -> Result<SystemStats> {
            Ok(SystemStats { timestamp: 1, ..Default::default() })
        }
    }

    struct MockCloud {
        messaging: Arc<SecureMessaging>,
        accept_register: AtomicBool,
        accept_stats: AtomicBool,
        registers: AtomicUsize,
        reports: AtomicUsize,
    }

    #[async_trait]
    impl CloudTransport for MockCloud {
        async fn register(&self, instance_id: &str, body: &Envelope) -> Result<Envelope> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            let stats: SystemStats = self.messaging.decode_as(instance_id, body).await?;
            assert_eq!(stats.timestamp, 1);
            if !self.accept_register.load(Ordering::SeqCst) {
                return Err(ShimError::Connectivity("cloud down".to_string()));
            }
            Ok(self
                .messaging
                .encode(instance_id, &serde_json::json!({"channel": "ch-1"}))
                .await?)
        }

        async fn send_stats(&self, _instance_id: &str, channel: &str, _body: &Envelope) -> Result<()> {
            assert_eq!(channel, "ch-1");
            self.reports.fetch_add(1, Ordering::SeqCst);
            if !self.accept_stats.load(Ordering::SeqCst) {
                return Err(ShimError::Connectivity("conn lost".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        instances: Arc<InstanceManager>,
        cloud: Arc<MockCloud>,
        heartbeat: Heartbeat,
    }

    async fn fixture(accept_register: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let messaging = Arc::new(SecureMessaging::default());
        let slots = (0..4).map(|i| KeySlot::from_text(&format!("k{i}"))).collect();
        messaging.keys().set("abc123", slots).await;

        let instances = Arc::new(InstanceManager::new(
            ShimConfig::rooted_at(dir.path()),
            Arc::new(MockRuntime::default()),
            messaging.clone(),
        ));
        instances.create("abc123").await.unwrap();

        let cloud = Arc::new(MockCloud {
            messaging: messaging.clone(),
            accept_register: AtomicBool::new(accept_register),
            accept_stats: AtomicBool::new(true),
            registers: AtomicUsize::new(0),
            reports: AtomicUsize::new(0),
        });
        let heartbeat = Heartbeat::new(instances.clone(), messaging, cloud.clone(), Arc::new(FixedStats));
        Fixture { _dir: dir, instances, cloud, heartbeat }
    }

    #[tokio::test]
    async fn test_failed_registration_backs_off_ten_seconds() {
        let f = fixture(false).await;
        let t0 = 1_000_000;

        f.heartbeat.tick_at(t0).await;
        let state = f.heartbeat.connection("abc123").await.unwrap();
        assert!(!state.connected);
        assert_eq!(state.register_after, t0 + REGISTER_BACKOFF_MS);

        f.heartbeat.tick_at(t0 + 5_000).await;
        assert_eq!(f.cloud.registers.load(Ordering::SeqCst), 1);

        f.cloud.accept_register.store(true, Ordering::SeqCst);
        f.heartbeat.tick_at(t0 + REGISTER_BACKOFF_MS).await;
        assert_eq!(f.cloud.registers.load(Ordering::SeqCst), 2);
        assert!(f.heartbeat.connection("abc123").await.unwrap().connected);
    }

    #[tokio::test]
    async fn test_registered_link_reports_every_five_seconds() {
        let f = fixture(true).await;
        let t0 = 2_000_000;

        f.heartbeat.tick_at(t0).await;
        let state = f.heartbeat.connection("abc123").await.unwrap();
        assert!(state.connected);
        assert_eq!(state.channel, "ch-1");
        assert_eq!(state.send_stats_after, t0);

        f.heartbeat.tick_at(t0 + 1_000).await;
        assert_eq!(f.cloud.reports.load(Ordering::SeqCst), 1);
        let state = f.heartbeat.connection("abc123").await.unwrap();
        assert_eq!(state.send_stats_after, t0 + 1_000 + STATS_INTERVAL_MS);

        f.heartbeat.tick_at(t0 + 2_000).await;
        assert_eq!(f.cloud.reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_failure_drops_link_and_schedules_reregistration() {
        let f = fixture(true).await;
        let t0 = 3_000_000;
        f.heartbeat.tick_at(t0).await;

        f.cloud.accept_stats.store(false, Ordering::SeqCst);
        f.heartbeat.tick_at(t0 + 1_000).await;

        let state = f.heartbeat.connection("abc123").await.unwrap();
        assert!(!state.connected);
        assert!(state.channel.is_empty());
        assert_eq!(state.phase, LinkPhase::Unregistered);
        assert_eq!(state.register_after, t0 + 1_000 + REGISTER_BACKOFF_MS);
    }

    #[tokio::test]
    async fn test_removed_instance_loses_connection_state() {
        let f = fixture(false).await;
        f.heartbeat.tick_at(10_000).await;
        assert!(f.heartbeat.connection("abc123").await.is_some());

        f.instances.remove("abc123", None).await.unwrap();
        f.heartbeat.tick_at(11_000).await;
        assert!(f.heartbeat.connection("abc123").await.is_none());
    }
}
