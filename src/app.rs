use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use coordinator_api::{create_app, AppState};
use coordinator_core::{AppConfig, MessageBus};
use coordinator_dispatcher::{EscalationChannel, LivenessMonitor, StateListener, TaskDispatcher};
use coordinator_infrastructure::{
    build_escalation_sink, install_prometheus_recorder, InMemoryMessageBus,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info};

/// 主应用程序：组装协调核心并运行后台循环
pub struct Application {
    config: AppConfig,
    bus: Arc<dyn MessageBus>,
    escalation: Arc<EscalationChannel>,
    dispatcher: Arc<TaskDispatcher>,
    liveness: Arc<LivenessMonitor>,
    listener: Arc<StateListener>,
    metrics_handle: Option<PrometheusHandle>,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        // 指标句柄在组件创建时绑定到全局recorder，必须先安装
        let metrics_handle = if config.observability.metrics_enabled {
            Some(install_prometheus_recorder().context("安装Prometheus指标导出器失败")?)
        } else {
            None
        };

        let bus: Arc<dyn MessageBus> =
            Arc::new(InMemoryMessageBus::with_config((&config.message_bus).into()));

        let sink = build_escalation_sink(&config.escalation).context("创建升级通道失败")?;
        let escalation = Arc::new(EscalationChannel::new(
            sink,
            Some(bus.clone()),
            config.escalation.clone(),
            config.dispatcher.inbox.clone(),
        ));

        let dispatcher = Arc::new(TaskDispatcher::new(&config, bus.clone(), escalation.clone()));
        let liveness = Arc::new(LivenessMonitor::new(dispatcher.clone(), config.liveness.clone()));
        let listener = Arc::new(StateListener::new(
            dispatcher.clone(),
            bus.clone(),
            config.dispatcher.inbox.clone(),
            config.message_bus.consume_batch_size,
            config.message_bus.dedup_window,
        ));

        info!(
            "协调核心初始化完成: 升级通道={}, 选择策略={}",
            config.escalation.sink, config.dispatcher.selection_strategy
        );

        Ok(Self {
            config,
            bus,
            escalation,
            dispatcher,
            liveness,
            listener,
            metrics_handle,
        })
    }

    /// 运行所有组件，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if self.config.dispatcher.enabled {
            let dispatcher = self.dispatcher.clone();
            let tick = Duration::from_millis(self.config.dispatcher.tick_interval_ms.max(1));
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(run_dispatch_loop(dispatcher, tick, rx)));
        }

        {
            let liveness = self.liveness.clone();
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { liveness.run(rx).await }));
        }

        {
            let listener = self.listener.clone();
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = listener.listen_for_updates(rx).await {
                    error!("状态监听器失败: {}", e);
                }
            }));
        }

        {
            let escalation = self.escalation.clone();
            let rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move { escalation.run_delivery_loop(rx).await }));
        }

        if self.config.api.enabled {
            let server = self.start_api(shutdown_rx.resubscribe()).await?;
            handles.push(server);
        }

        let _ = shutdown_rx.recv().await;
        info!("协调核心收到关闭信号，等待后台任务退出");

        for handle in handles {
            let _ = handle.await;
        }

        info!("所有组件已停止");
        Ok(())
    }

    async fn start_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<JoinHandle<()>> {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            bus: self.bus.clone(),
            metrics_handle: self.metrics_handle.clone(),
        };
        let app = create_app(state, &self.config.api);

        let listener = TcpListener::bind(&self.config.api.bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
        info!("API服务器启动在 http://{}", self.config.api.bind_address);

        Ok(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
            match result {
                Ok(()) => info!("API服务器已停止"),
                Err(e) => error!("API服务器运行失败: {}", e),
            }
        }))
    }
}

/// 调度循环：按固定间隔或事件触发执行一轮调度
async fn run_dispatch_loop(
    dispatcher: Arc<TaskDispatcher>,
    tick: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick);
    info!("调度循环已启动，间隔 {:?}", tick);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = dispatcher.dispatch_requested() => {}
            _ = shutdown_rx.recv() => {
                info!("调度循环收到关闭信号");
                break;
            }
        }

        let report = dispatcher.dispatch_tick().await;
        if report.assigned > 0 {
            debug!(
                "本轮调度: 检查 {} 个任务，分配 {} 个，阻塞 {} 个",
                report.examined, report.assigned, report.blocked
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::{TaskState, TaskSubmission, WorkerHeartbeat, WorkerRegistration, WorkerStatus};

    fn offline_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.api.enabled = false;
        config.observability.metrics_enabled = false;
        config.escalation.sink = "memory".to_string();
        config.dispatcher.tick_interval_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_application_dispatches_until_shutdown() {
        let app = Arc::new(Application::new(offline_config()).unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.run(shutdown_rx).await })
        };

        app.dispatcher
            .register_worker(WorkerRegistration::new("w-1", &["build"], 1))
            .await
            .unwrap();
        app.dispatcher
            .heartbeat(&WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0))
            .await
            .unwrap();
        let task_id = app
            .dispatcher
            .submit_task(TaskSubmission::new(serde_json::json!({"cmd": "make"}), &["build"]))
            .await
            .unwrap();

        let mut state = TaskState::Pending;
        for _ in 0..50 {
            state = app.dispatcher.get_task_status(&task_id).await.unwrap().state;
            if state == TaskState::Assigned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, TaskState::Assigned);

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), runner).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[test]
    fn test_unknown_escalation_sink_is_rejected() {
        let mut config = offline_config();
        config.escalation.sink = "pager".to_string();
        assert!(Application::new(config).is_err());
    }
}
