use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runtime::FlowEngine;

/// 超时监督器：周期性扫描到期的问题与 delay
///
/// 通过 [`TimeoutSupervisor::spawn`] 启动，返回的句柄负责停止。
pub struct TimeoutSupervisor {
    engine: FlowEngine,
    interval: Duration,
}

impl TimeoutSupervisor {
    pub fn new(engine: FlowEngine) -> Self {
        let interval = engine.config().sweep_interval();
        Self { engine, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(sweep_loop(self.engine, self.interval, shutdown_rx));
        SupervisorHandle {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }
}

/// 运行中的监督器句柄
pub struct SupervisorHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// 停止扫描并等待当前一轮结束
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.join.await;
    }
}

async fn sweep_loop(engine: FlowEngine, period: Duration, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    info!(interval_ms = period.as_millis() as u64, "timeout supervisor started");

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                info!("timeout supervisor stopped");
                return;
            }

            _ = interval.tick() => {
                match engine.sweep(Utc::now()).await {
                    Ok(0) => {}
                    Ok(advanced) => debug!(advanced, "expired conversations advanced"),
                    Err(err) => warn!(error = %err, "timeout sweep failed"),
                }
            }
        }
    }
}
