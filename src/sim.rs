//! Random-walk simulation of peers sharing one broker.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use worldcomms_core::{Position, Topic, UserProfile};
use worldcomms_net::{
    ChannelMessage, ChatData, Connection, Handler, PositionData, ProfileData, SubscriptionManager,
    TrafficCounters,
};
use worldcomms_testkit::{LocalBroker, PeerTraffic, TrafficReport};

use crate::config::SimConfig;

struct SimPeer {
    alias: String,
    connection: Connection,
    inbound: UnboundedReceiver<ChannelMessage>,
    subscriptions: SubscriptionManager,
    stats: Arc<TrafficCounters>,
    delivered: Arc<AtomicU64>,
    subscription_updates: u64,
    position: Position,
}

impl SimPeer {
    fn spawn(broker: &LocalBroker, config: &SimConfig, rng: &mut StdRng) -> Self {
        let (channels, inbound, alias) = broker.connect(true, true);
        let stats = Arc::new(TrafficCounters::new());
        let mut connection =
            Connection::new(channels, config.connection.clone(), Some(stats.clone()));
        let delivered = Arc::new(AtomicU64::new(0));

        connection.set_position_handler(Some(counting(&delivered)));
        connection.set_profile_handler(Some(counting(&delivered)));
        connection.set_scene_message_handler(Some(counting(&delivered)));
        let chat_count = delivered.clone();
        let own = alias.clone();
        let on_chat: Handler<ChatData> = Box::new(move |from: &str, chat: ChatData| {
            chat_count.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %own, %from, text = %chat.text, "chat received");
            Ok(())
        });
        connection.set_chat_handler(Some(on_chat));

        let mut subscriptions = SubscriptionManager::new(config.connection.grid.clone());
        subscriptions.pin(Topic::new(config.scene_id.clone()));

        let radius = config.spawn_radius.abs().max(f32::EPSILON);
        let position = Position::at(
            rng.gen_range(-radius..radius),
            0.0,
            rng.gen_range(-radius..radius),
        );

        Self {
            alias,
            connection,
            inbound,
            subscriptions,
            stats,
            delivered,
            subscription_updates: 0,
            position,
        }
    }

    fn step(&mut self, index: usize, tick: u64, config: &SimConfig, rng: &mut StdRng) {
        if tick > 0 && config.walk_step > 0.0 {
            let step = config.walk_step;
            let dx = rng.gen_range(-step..=step);
            let dz = rng.gen_range(-step..=step);
            let half_yaw = dx.atan2(dz) / 2.0;
            self.position = Position::at(self.position.x + dx, 0.0, self.position.z + dz)
                .with_rotation(0.0, half_yaw.sin(), 0.0, half_yaw.cos());
        }

        match self.subscriptions.on_position(&self.position, &self.connection) {
            Ok(true) => self.subscription_updates += 1,
            Ok(false) => {}
            Err(err) => warn!(peer = %self.alias, "Subscription update failed: {err}"),
        }
        if let Err(err) = self.connection.send_position(&self.position) {
            warn!(peer = %self.alias, "Position send failed: {err}");
        }

        if tick == 0 {
            let profile = UserProfile::named(format!("walker-{}", self.alias));
            if let Err(err) = self.connection.send_profile(&self.position, &profile) {
                warn!(peer = %self.alias, "Profile send failed: {err}");
            }
        }
        if config.chat_every > 0 && (tick + index as u64) % config.chat_every == 0 {
            let id = format!("{}-{tick}", self.alias);
            let text = format!("hello from {}", self.alias);
            if let Err(err) = self.connection.send_chat(&self.position, &id, &text) {
                warn!(peer = %self.alias, "Chat send failed: {err}");
            }
        }
        if tick == config.ticks / 2 {
            let text = format!("{} passed the halfway mark", self.alias);
            if let Err(err) = self.connection.send_scene_message(&config.scene_id, &text) {
                warn!(peer = %self.alias, "Scene message failed: {err}");
            }
        }
    }

    fn drain(&mut self) -> usize {
        self.connection.drain_inbound(&mut self.inbound, usize::MAX)
    }

    fn finish(mut self) -> PeerTraffic {
        self.drain();
        self.connection.close();
        PeerTraffic {
            latency_ms: self
                .connection
                .latency()
                .map(|rtt| rtt.as_millis().min(u64::MAX as u128) as u64),
            subscription_updates: self.subscription_updates,
            delivered: self.delivered.load(Ordering::Relaxed),
            traffic: self.stats.snapshot(),
            alias: self.alias,
        }
    }
}

fn counting<T: 'static>(counter: &Arc<AtomicU64>) -> Handler<T> {
    let counter = counter.clone();
    Box::new(move |_from: &str, _data: T| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
}

/// Run the simulation until `config.ticks` elapse or ctrl-c arrives.
pub async fn run(config: &SimConfig) -> Result<TrafficReport> {
    config
        .connection
        .grid
        .validate()
        .context("invalid grid configuration")?;

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let broker = LocalBroker::new();
    let mut peers: Vec<SimPeer> = (0..config.peers)
        .map(|_| SimPeer::spawn(&broker, config, &mut rng))
        .collect();
    info!(peers = peers.len(), ticks = config.ticks, "simulation started");

    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut completed = 0;
    while completed < config.ticks {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => {
                warn!(tick = completed, "Interrupted; writing partial report");
                break;
            }
        }
        for (index, peer) in peers.iter_mut().enumerate() {
            peer.step(index, completed, config, &mut rng);
        }
        let handled: usize = peers.iter_mut().map(SimPeer::drain).sum();
        debug!(tick = completed, handled, "tick complete");
        completed += 1;
    }

    let mut report = TrafficReport::new("simulation", completed);
    report.peers = peers.into_iter().map(SimPeer::finish).collect();
    info!(
        routed = broker.routed_frames(),
        sent = report.total_sent(),
        "simulation finished"
    );
    Ok(report)
}
