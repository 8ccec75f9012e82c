pub mod http;
pub mod telegram;

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::format::DeliveryPayload;
use crate::settings::{DeliveryMode, Settings};

/// Per-branch delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BranchReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Which fan-out branches a `dispatch` call started.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub http: bool,
    pub telegram: bool,
}

/// Spawned branches plus the shutdown flag, guarded together so a dispatch
/// can never slip a task in after `shutdown` has taken the set.
#[derive(Default)]
struct Branches {
    set: JoinSet<()>,
    closed: bool,
}

/// Fire-and-forget fan-out to HTTP sinks and Telegram chats.
///
/// Every branch runs as its own task on the runtime captured at
/// construction, so `dispatch` can be called from any thread. A semaphore
/// caps how many branches do network I/O at once.
pub struct Dispatcher {
    client: reqwest::Client,
    telegram_api_base: String,
    runtime: Handle,
    permits: Arc<Semaphore>,
    tasks: Mutex<Branches>,
}

impl Dispatcher {
    /// Must be called from inside a Tokio runtime.
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().context("Dispatcher must be created inside a Tokio runtime")?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            telegram_api_base: config.telegram_api_base.clone(),
            runtime,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            tasks: Mutex::new(Branches::default()),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, Branches> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of branch tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks();
        while tasks.set.try_join_next().is_some() {}
        tasks.set.len()
    }

    /// Start delivery of `payload` according to the `settings` snapshot and
    /// return immediately.
    pub fn dispatch(
        &self,
        settings: Arc<Settings>,
        payload: Arc<DeliveryPayload>,
        dispatch_id: Uuid,
    ) -> DispatchPlan {
        let mut tasks = self.tasks();
        if tasks.closed {
            warn!(%dispatch_id, "Dispatcher is shut down, dropping message");
            return DispatchPlan::default();
        }

        let (want_http, want_telegram) = match &settings.delivery_mode {
            DeliveryMode::Http => (true, false),
            DeliveryMode::Telegram => (false, true),
            DeliveryMode::All => (true, true),
            DeliveryMode::Unrecognized(raw) => {
                warn!(%dispatch_id, "Unknown deliveryType `{}`, sending to all sinks", raw);
                (true, true)
            }
        };

        let mut plan = DispatchPlan::default();
        // Reap finished branches so the set does not grow without bound.
        while tasks.set.try_join_next().is_some() {}

        if want_http {
            if settings.http_sinks.is_empty() {
                debug!(%dispatch_id, "No HTTP sinks configured");
            } else {
                let client = self.client.clone();
                let permits = self.permits.clone();
                let settings = settings.clone();
                let payload = payload.clone();
                let span = info_span!("http_fanout", %dispatch_id);
                tasks.set.spawn_on(
                    async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return;
                        };
                        let report =
                            http::send_all(&client, &settings.http_sinks, &payload).await;
                        info!(
                            delivered = report.delivered,
                            failed = report.failed,
                            skipped = report.skipped,
                            "HTTP fan-out finished"
                        );
                    }
                    .instrument(span),
                    &self.runtime,
                );
                plan.http = true;
            }
        }

        if want_telegram {
            match settings.telegram_token() {
                Some(_) if !settings.telegram_chat_ids.is_empty() => {
                    let client = self.client.clone();
                    let permits = self.permits.clone();
                    let api_base = self.telegram_api_base.clone();
                    let settings = settings.clone();
                    let payload = payload.clone();
                    let span = info_span!("telegram_fanout", %dispatch_id);
                    tasks.set.spawn_on(
                        async move {
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            let token = settings.telegram_token().unwrap_or_default();
                            let report = telegram::send_all(
                                &client,
                                &api_base,
                                token,
                                &settings.telegram_chat_ids,
                                &settings.telegram_parse_mode,
                                &payload,
                            )
                            .await;
                            info!(
                                delivered = report.delivered,
                                failed = report.failed,
                                skipped = report.skipped,
                                "Telegram fan-out finished"
                            );
                        }
                        .instrument(span),
                        &self.runtime,
                    );
                    plan.telegram = true;
                }
                _ => debug!(%dispatch_id, "Telegram token or chat ids missing, skipping"),
            }
        }

        plan
    }

    /// Refuse new dispatches, wait up to `grace` for in-flight sends, then
    /// abort whatever is left. Returns the number of aborted branches.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut tasks = {
            let mut guard = self.tasks();
            guard.closed = true;
            std::mem::take(&mut guard.set)
        };

        let pending = tasks.len();
        if pending > 0 {
            info!("Waiting for {} in-flight deliveries", pending);
        }

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            return 0;
        }

        let aborted = tasks.len();
        warn!("Aborting {} deliveries still running after {:?}", aborted, grace);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_dispatch_config;
    use crate::settings::{ChatId, HttpSink};

    fn payload() -> Arc<DeliveryPayload> {
        Arc::new(DeliveryPayload {
            sender: "Vodafone".to_string(),
            msg: "Your OTP is 1234".to_string(),
            timestamp: "2024-03-01 09:30:00".to_string(),
            phone_number: String::new(),
        })
    }

    fn dispatcher(server: &mockito::Server) -> Dispatcher {
        let mut config = default_dispatch_config();
        config.telegram_api_base = server.url();
        config.request_timeout_secs = 5;
        Dispatcher::new(&config).unwrap()
    }

    fn settings(server: &mockito::Server, mode: DeliveryMode) -> Settings {
        Settings {
            enabled: true,
            delivery_mode: mode,
            http_sinks: vec![HttpSink {
                url: format!("{}/hook", server.url()),
                headers: Default::default(),
            }],
            telegram_bot_token: Some("123:abc".to_string()),
            telegram_chat_ids: vec![ChatId::Number(42)],
            ..Settings::default()
        }
    }

    async fn mocks(
        server: &mut mockito::Server,
        http: usize,
        tg: usize,
    ) -> (mockito::Mock, mockito::Mock) {
        let hook = server
            .mock("POST", "/hook")
            .with_status(200)
            .expect(http)
            .create_async()
            .await;
        let telegram = server
            .mock("POST", "/bot123:abc/sendMessage")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(tg)
            .create_async()
            .await;
        (hook, telegram)
    }

    #[tokio::test]
    async fn test_http_mode_skips_telegram() {
        let mut server = mockito::Server::new_async().await;
        let (hook, telegram) = mocks(&mut server, 1, 0).await;
        let dispatcher = dispatcher(&server);

        let plan = dispatcher.dispatch(
            Arc::new(settings(&server, DeliveryMode::Http)),
            payload(),
            Uuid::new_v4(),
        );
        assert_eq!(plan, DispatchPlan { http: true, telegram: false });

        assert_eq!(dispatcher.shutdown(Duration::from_secs(5)).await, 0);
        hook.assert_async().await;
        telegram.assert_async().await;
    }

    #[tokio::test]
    async fn test_telegram_mode_skips_http() {
        let mut server = mockito::Server::new_async().await;
        let (hook, telegram) = mocks(&mut server, 0, 1).await;
        let dispatcher = dispatcher(&server);

        let plan = dispatcher.dispatch(
            Arc::new(settings(&server, DeliveryMode::Telegram)),
            payload(),
            Uuid::new_v4(),
        );
        assert_eq!(plan, DispatchPlan { http: false, telegram: true });

        dispatcher.shutdown(Duration::from_secs(5)).await;
        hook.assert_async().await;
        telegram.assert_async().await;
    }

    #[tokio::test]
    async fn test_unrecognized_mode_sends_to_both() {
        let mut server = mockito::Server::new_async().await;
        let (hook, telegram) = mocks(&mut server, 1, 1).await;
        let dispatcher = dispatcher(&server);

        let plan = dispatcher.dispatch(
            Arc::new(settings(&server, DeliveryMode::Unrecognized("pigeon".into()))),
            payload(),
            Uuid::new_v4(),
        );
        assert_eq!(plan, DispatchPlan { http: true, telegram: true });

        dispatcher.shutdown(Duration::from_secs(5)).await;
        hook.assert_async().await;
        telegram.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_telegram_branch() {
        let mut server = mockito::Server::new_async().await;
        let (hook, telegram) = mocks(&mut server, 1, 0).await;
        let dispatcher = dispatcher(&server);

        let mut no_token = settings(&server, DeliveryMode::All);
        no_token.telegram_bot_token = Some(String::new());
        let plan = dispatcher.dispatch(Arc::new(no_token), payload(), Uuid::new_v4());
        assert!(!plan.telegram);

        let mut no_chats = settings(&server, DeliveryMode::Telegram);
        no_chats.telegram_chat_ids.clear();
        let plan = dispatcher.dispatch(Arc::new(no_chats), payload(), Uuid::new_v4());
        assert_eq!(plan, DispatchPlan::default());

        dispatcher.shutdown(Duration::from_secs(5)).await;
        hook.assert_async().await;
        telegram.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_sink_list_spawns_nothing() {
        let server = mockito::Server::new_async().await;
        let dispatcher = dispatcher(&server);

        let mut empty = settings(&server, DeliveryMode::Http);
        empty.http_sinks.clear();
        let plan = dispatcher.dispatch(Arc::new(empty), payload(), Uuid::new_v4());

        assert_eq!(plan, DispatchPlan::default());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_dropped() {
        let mut server = mockito::Server::new_async().await;
        let (hook, _telegram) = mocks(&mut server, 0, 0).await;
        let dispatcher = dispatcher(&server);

        dispatcher.shutdown(Duration::from_secs(1)).await;
        let plan = dispatcher.dispatch(
            Arc::new(settings(&server, DeliveryMode::Http)),
            payload(),
            Uuid::new_v4(),
        );

        assert_eq!(plan, DispatchPlan::default());
        hook.assert_async().await;
    }

    /// A TCP endpoint that accepts connections and never answers.
    pub(crate) async fn silent_listener() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr
    }

    fn hung_settings(addr: std::net::SocketAddr) -> Arc<Settings> {
        Arc::new(Settings {
            enabled: true,
            delivery_mode: DeliveryMode::Http,
            http_sinks: vec![HttpSink {
                url: format!("http://{}/hang", addr),
                headers: Default::default(),
            }],
            ..Settings::default()
        })
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_delivery() {
        let addr = silent_listener().await;
        let mut config = default_dispatch_config();
        config.request_timeout_secs = 60;
        let dispatcher = Dispatcher::new(&config).unwrap();

        dispatcher.dispatch(hung_settings(addr), payload(), Uuid::new_v4());

        let aborted = dispatcher.shutdown(Duration::from_millis(200)).await;
        assert_eq!(aborted, 1);
    }

    #[tokio::test]
    async fn test_request_timeout_ends_hung_delivery() {
        let addr = silent_listener().await;
        let mut config = default_dispatch_config();
        config.request_timeout_secs = 1;
        let dispatcher = Dispatcher::new(&config).unwrap();

        let plan = dispatcher.dispatch(hung_settings(addr), payload(), Uuid::new_v4());
        assert!(plan.http);

        // The branch finishes on its own once the request times out.
        assert_eq!(dispatcher.shutdown(Duration::from_secs(5)).await, 0);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_branch_survives_concurrent_shutdown() {
        let addr = silent_listener().await;
        let mut config = default_dispatch_config();
        config.request_timeout_secs = 60;
        let dispatcher = Arc::new(Dispatcher::new(&config).unwrap());

        let caller = {
            let dispatcher = dispatcher.clone();
            let settings = hung_settings(addr);
            std::thread::spawn(move || loop {
                let plan = dispatcher.dispatch(settings.clone(), payload(), Uuid::new_v4());
                if plan == DispatchPlan::default() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let aborted = dispatcher.shutdown(Duration::from_millis(100)).await;
        caller.join().unwrap();

        assert!(aborted > 0);
        // Anything accepted after shutdown took the set would still be here.
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
