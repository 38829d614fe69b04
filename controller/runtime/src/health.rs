use crate::{
    core::{conditions, Condition, Conditions},
    index::TunnelClient,
};
use std::sync::Arc;
use tokio::time;

/// Checks that a hub's tunnel is alive.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> anyhow::Result<()>;
}

/// Records each hub's tunnel health as its `TunnelHealth` condition.
///
/// A failing probe keeps the condition's status true and flips its reason to
/// `Unhealthy`; readiness aggregation keys on the reason.
#[derive(Debug)]
pub struct Prober {
    conditions: Arc<Conditions>,
    throttle: time::Duration,
    last_run: Option<time::Instant>,
}

// === impl Prober ===

impl Prober {
    pub fn new(conditions: Arc<Conditions>, throttle: time::Duration) -> Self {
        Self {
            conditions,
            throttle,
            last_run: None,
        }
    }

    /// Probes each hub in turn. Returns false, without probing, if the
    /// previous run finished less than the throttle interval ago.
    pub async fn run<P: Probe>(&mut self, targets: &[(String, P)]) -> bool {
        if let Some(last) = self.last_run {
            if last.elapsed() < self.throttle {
                tracing::debug!("Skipping probes");
                return false;
            }
        }

        for (hub, probe) in targets {
            let cond = match probe.check().await {
                Ok(()) => Condition::new(
                    conditions::TUNNEL_HEALTH,
                    true,
                    conditions::REASON_HEALTHY,
                    "",
                ),
                Err(error) => {
                    tracing::debug!(%hub, %error, "Tunnel probe failed");
                    Condition::new(
                        conditions::TUNNEL_HEALTH,
                        true,
                        conditions::REASON_UNHEALTHY,
                        format!("{error:#}"),
                    )
                }
            };
            let reason = cond.reason.clone();
            if self.conditions.set(hub, cond) {
                tracing::info!(%hub, %reason, "Tunnel health changed");
            }
        }

        self.last_run = Some(time::Instant::now());
        true
    }
}

#[async_trait::async_trait]
impl Probe for TunnelClient {
    async fn check(&self) -> anyhow::Result<()> {
        self.probe().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Fake {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Probe for Arc<Fake> {
        async fn check(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                anyhow::bail!("connection refused")
            }
        }
    }

    const THROTTLE: time::Duration = time::Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn health_flips_reason_only() {
        let conds = Arc::new(Conditions::default());
        conds.set(
            "hub-0",
            Condition::new(conditions::CONNECTED, true, "Connected", ""),
        );
        let fake = Arc::new(Fake::default());
        let targets = [("hub-0".to_string(), fake.clone())];
        let mut prober = Prober::new(conds.clone(), THROTTLE);

        assert!(prober.run(&targets).await);
        let health = conds.find("hub-0", conditions::TUNNEL_HEALTH).unwrap();
        assert_eq!(health.status, crate::core::ConditionStatus::True);
        assert_eq!(health.reason, conditions::REASON_UNHEALTHY);
        assert_eq!(health.message, "connection refused");
        assert_eq!(
            conds.ready("hub-0", &[conditions::CONNECTED, conditions::TUNNEL_HEALTH]),
            (false, conditions::REASON_UNHEALTHY.to_string())
        );

        fake.healthy.store(true, Ordering::SeqCst);
        time::sleep(THROTTLE).await;
        assert!(prober.run(&targets).await);
        assert_eq!(
            conds.ready("hub-0", &[conditions::CONNECTED, conditions::TUNNEL_HEALTH]),
            (true, String::new())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttles_back_to_back_runs() {
        let conds = Arc::new(Conditions::default());
        let fake = Arc::new(Fake::default());
        let targets = [("hub-0".to_string(), fake.clone())];
        let mut prober = Prober::new(conds, THROTTLE);

        assert!(prober.run(&targets).await);
        time::sleep(THROTTLE / 2).await;
        assert!(!prober.run(&targets).await);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);

        time::sleep(THROTTLE / 2).await;
        assert!(prober.run(&targets).await);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }
}
