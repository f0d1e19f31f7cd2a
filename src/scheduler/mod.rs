use crate::client::{run_virtual_client, ClientIdentity};
use crate::config::{Config, LoadConfig};
use crate::metrics::MetricsCollector;
use crate::utils::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One scheduling unit: `concurrency` clients starting together at
/// `start_offset` from run start, all forced to stop `max_duration` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wave {
    pub index: u32,
    pub concurrency: u32,
    pub start_offset: Duration,
    pub max_duration: Duration,
}

/// The wave grid: N waves of W clients, one every Δ.
///
/// Waves are independent once started; wave k+1 starts at its offset even
/// while wave k's clients are still active, so peak concurrency is the sum
/// of all overlapping waves.
#[derive(Debug, Clone, Copy)]
pub struct WavePlan {
    pub waves: u32,
    pub clients_per_wave: u32,
    pub stagger: Duration,
    pub wave_max_duration: Duration,
}

impl WavePlan {
    pub fn from_config(load: &LoadConfig) -> Self {
        Self {
            waves: load.waves,
            clients_per_wave: load.clients_per_wave,
            stagger: load.stagger(),
            wave_max_duration: load.wave_max_duration(),
        }
    }

    pub fn total_clients(&self) -> u64 {
        self.waves as u64 * self.clients_per_wave as u64
    }

    pub fn wave(&self, index: u32) -> Wave {
        Wave {
            index,
            concurrency: self.clients_per_wave,
            start_offset: self.stagger * index,
            max_duration: self.wave_max_duration,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Wave> + '_ {
        (0..self.waves).map(|i| self.wave(i))
    }

    /// How many clients have been started once `elapsed` has passed:
    /// `W × min(N, floor(t/Δ) + 1)`.
    pub fn clients_started_by(&self, elapsed: Duration) -> u64 {
        let waves_started = if self.stagger.is_zero() {
            self.waves as u64
        } else {
            let fired = elapsed.as_nanos() / self.stagger.as_nanos();
            (fired as u64 + 1).min(self.waves as u64)
        };
        waves_started * self.clients_per_wave as u64
    }

    /// When the last wave's stop bound lands, relative to run start.
    pub fn horizon(&self) -> Duration {
        self.stagger * self.waves.saturating_sub(1) + self.wave_max_duration
    }
}

/// Starts the virtual-client population in staggered waves.
pub struct BatchScheduler {
    config: Arc<Config>,
    metrics: Arc<MetricsCollector>,
    plan: WavePlan,
}

impl BatchScheduler {
    pub fn new(config: Arc<Config>, metrics: Arc<MetricsCollector>) -> Self {
        let plan = WavePlan::from_config(&config.load);
        Self {
            config,
            metrics,
            plan,
        }
    }

    pub fn plan(&self) -> &WavePlan {
        &self.plan
    }

    /// Run every wave to completion. Cancelling `cancel` stops all waves:
    /// not-yet-started waves never start, active clients are forced into
    /// Closing.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let run_start = Instant::now();
        info!(
            waves = self.plan.waves,
            clients_per_wave = self.plan.clients_per_wave,
            total = self.plan.total_clients(),
            stagger_ms = self.plan.stagger.as_millis() as u64,
            "starting load run"
        );

        let mut waves = JoinSet::new();
        for wave in self.plan.iter() {
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            let token = cancel.child_token();
            waves.spawn(run_wave(wave, run_start, config, metrics, token));
        }

        while let Some(joined) = waves.join_next().await {
            if let Err(e) = joined {
                error!("wave task panicked: {}", e);
            }
        }

        info!("load run complete");
        Ok(())
    }
}

async fn run_wave(
    wave: Wave,
    run_start: Instant,
    config: Arc<Config>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep_until(run_start + wave.start_offset) => {}
    }

    info!(
        wave = wave.index,
        clients = wave.concurrency,
        "wave starting"
    );

    // One token per wave: the stop bound covers clients still mid-handshake
    let wave_cancel = cancel.child_token();
    let stopper = {
        let token = wave_cancel.clone();
        let bound = wave.max_duration;
        tokio::spawn(async move {
            tokio::time::sleep(bound).await;
            token.cancel();
        })
    };

    let mut clients = JoinSet::new();
    for slot in 0..wave.concurrency {
        // 1-based run-wide ordinal; cannot overflow, config validation caps
        // waves x clients_per_wave below u32::MAX - USERID_BASE
        let ordinal = wave.index * wave.concurrency + slot + 1;
        let identity = ClientIdentity::derive(ordinal, &config.topic, &config.subscription);
        clients.spawn(run_virtual_client(
            config.clone(),
            identity,
            metrics.clone(),
            wave_cancel.clone(),
        ));
    }

    while let Some(joined) = clients.join_next().await {
        if let Err(e) = joined {
            error!(wave = wave.index, "client task panicked: {}", e);
        }
    }

    stopper.abort();
    info!(wave = wave.index, "wave complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> WavePlan {
        WavePlan {
            waves: 40,
            clients_per_wave: 250,
            stagger: Duration::from_secs(15),
            wave_max_duration: Duration::from_secs(900),
        }
    }

    #[test]
    fn test_wave_offsets() {
        let plan = plan();
        assert_eq!(plan.wave(0).start_offset, Duration::ZERO);
        assert_eq!(plan.wave(1).start_offset, Duration::from_secs(15));
        assert_eq!(plan.wave(39).start_offset, Duration::from_secs(585));
        assert_eq!(plan.iter().count(), 40);
    }

    #[test]
    fn test_clients_started_by_formula() {
        let plan = plan();
        // W × min(N, floor(t/Δ) + 1)
        assert_eq!(plan.clients_started_by(Duration::ZERO), 250);
        assert_eq!(plan.clients_started_by(Duration::from_secs(14)), 250);
        assert_eq!(plan.clients_started_by(Duration::from_secs(15)), 500);
        assert_eq!(plan.clients_started_by(Duration::from_secs(44)), 750);
        assert_eq!(plan.clients_started_by(Duration::from_secs(585)), 10_000);
        assert_eq!(plan.clients_started_by(Duration::from_secs(100_000)), 10_000);
        assert_eq!(plan.total_clients(), 10_000);
    }

    #[test]
    fn test_zero_stagger_starts_everything() {
        let plan = WavePlan {
            waves: 4,
            clients_per_wave: 10,
            stagger: Duration::ZERO,
            wave_max_duration: Duration::from_secs(1),
        };
        assert_eq!(plan.clients_started_by(Duration::ZERO), 40);
    }

    #[test]
    fn test_horizon_covers_last_wave() {
        let plan = plan();
        assert_eq!(plan.horizon(), Duration::from_secs(585 + 900));
    }
}
