//! 通知工作者服务入口
//!
//! 负责装配各个组件并运行主循环，收到 Ctrl-C 后在当前轮次结束时退出。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fanout_shared::{config::AppConfig, database::Database, kv::KvStore, observability};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use notification_worker::{
    badge::{PgBadgeCounter, UserLocks},
    cursor::{DmCursors, RedisCursorStore},
    dm::{DmEngine, DmEngineSettings, store::PgDmStore},
    email::{DigestScheduler, store::PgDigestStore},
    hash_id::HashIds,
    listener::{self, ChangeListener, PgNotificationFetcher, SeenListener},
    mapping::{DeliveryContext, MapperRegistry},
    orchestrator::Orchestrator,
    processor::Processor,
    remote_config::{FeatureFlags, PolledRemoteConfig},
    retry_queue::RedisRetryQueue,
    sender::{GatewayClient, HttpBrowserPushGateway, HttpEmailGateway, HttpPushGateway},
    settings::{PgEntityLookup, PgUserSettingsStore},
};

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置：.env、config/default.toml、config/{service}.toml 与 NOTIF_ 前缀的环境变量
    let config = AppConfig::load(SERVICE_NAME)?;

    // 2. 日志与指标
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(environment = %config.environment, "Starting notification-worker...");

    // 3. 业务库、身份库与 Redis
    let discovery = Database::connect("discovery", &config.database).await?;
    let identity = Database::connect("identity", &config.identity_database).await?;
    let kv = KvStore::new(&config.redis)?;
    kv.health_check().await?;
    info!("Storage connections established");

    // 4. 远程开关
    let remote = PolledRemoteConfig::init(&config.remote_config).await?;
    let flags = FeatureFlags::new(remote.clone());

    // 5. 投递网关与协作者
    let client = GatewayClient::new(&config.gateways)?;
    let badges = Arc::new(PgBadgeCounter::new(identity.pool().clone()));
    let locks = Arc::new(UserLocks::new());
    let entities = Arc::new(PgEntityLookup::new(discovery.pool().clone()));
    let email = Arc::new(HttpEmailGateway::new(client.clone(), &config.gateways));
    let ctx = DeliveryContext {
        settings: Arc::new(PgUserSettingsStore::new(
            discovery.pool().clone(),
            identity.pool().clone(),
        )),
        entities: entities.clone(),
        badges: badges.clone(),
        locks: locks.clone(),
        push: Arc::new(HttpPushGateway::new(client.clone(), &config.gateways)),
        browser_push: Arc::new(HttpBrowserPushGateway::new(client, &config.gateways)),
        email: email.clone(),
        email_from: config.gateways.email_from.clone(),
    };

    // 6. 处理器、私信引擎与摘要调度
    let retry_queue = Arc::new(RedisRetryQueue::new(
        kv.clone(),
        config.worker.retry_queue_key.clone(),
    ));
    let processor = Processor::new(
        MapperRegistry::with_defaults(),
        flags.clone(),
        ctx.clone(),
        retry_queue,
        config.worker.notification_batch_size,
    );

    let cursors = DmCursors::new(
        Arc::new(RedisCursorStore::new(kv)),
        config.cursor_keys.clone(),
    );
    let dm = DmEngine::new(
        Arc::new(PgDmStore::new(discovery.pool().clone())),
        cursors,
        ctx,
        flags.clone(),
        DmEngineSettings {
            notification_delay: config.worker.dm_notification_delay(),
            blast_delay: config.worker.blast_delay(),
            blast_batch_size: config.worker.blast_user_batch_size,
            hash_ids: HashIds::new(
                &config.worker.hash_id_salt,
                config.worker.hash_id_min_length,
            )?,
        },
    );

    let digest = DigestScheduler::new(
        Arc::new(PgDigestStore::new(
            discovery.pool().clone(),
            identity.pool().clone(),
        )),
        entities,
        email,
        flags,
        config.gateways.email_from.clone(),
        config.worker.dm_notification_delay(),
    );

    // 7. 订阅通知写入与已读变更
    let changes = Arc::new(ChangeListener::new(Arc::new(PgNotificationFetcher::new(
        discovery.pool().clone(),
    ))));
    let notification_listener = listener::start(
        discovery.pool(),
        &config.listener.notification_channel,
        changes.clone(),
    )
    .await?;
    let seen_listener = listener::start(
        discovery.pool(),
        &config.listener.seen_channel,
        Arc::new(SeenListener::new(badges)),
    )
    .await?;

    // 8. Ctrl-C 置位停止标志
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!(error = %e, "无法监听退出信号"),
        }
        let _ = stop_tx.send(true);
    });

    let orchestrator = Orchestrator::new(
        changes,
        processor,
        dm,
        locks,
        config.worker.poll_interval(),
    )
    .with_digest(
        digest,
        Duration::from_secs(config.worker.email_digest_interval_secs),
    )
    .with_listeners(vec![notification_listener, seen_listener]);

    let result = orchestrator.run(stop_rx).await;

    remote.close();
    discovery.close().await;
    identity.close().await;

    if let Err(e) = &result {
        error!(error = %e, "notification-worker 异常退出");
    }
    info!("notification-worker stopped");
    result.map_err(Into::into)
}
