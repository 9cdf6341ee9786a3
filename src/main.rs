pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod pool;
pub mod upstream;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use gateway::GatewayState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing();

    let store = Arc::new(credential::store::Store::new(&cfg.data_dir));
    if let Err(e) = store.load().await {
        tracing::warn!("加载 keys.json 失败: {e:#}");
    }

    let upstream = upstream::UpstreamClient::new(&cfg).context("初始化上游客户端失败")?;

    // 后台余额同步：定期把本地估算余额校准到上游账单视图。
    if cfg.auto_sync {
        pool::reconciler::spawn_sync_task(
            store.clone(),
            upstream.clone(),
            Duration::from_secs(cfg.sync_interval_secs),
            cfg.sync_batch_size,
        );
    }

    let state = Arc::new(GatewayState {
        cfg: cfg.clone(),
        store,
        upstream,
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/api/status", get(handle_status))
        .with_state(state.clone());

    // === API 路由 ===
    let api_routes = Router::new()
        .route("/v1/models", get(gateway::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handle_chat_completions),
        )
        .with_state(state.clone());

    // === 管理路由 ===
    let admin_routes = Router::new()
        .route("/admin/stats", get(gateway::admin::handle_stats))
        .route(
            "/admin/keys",
            get(gateway::admin::handle_list_keys).post(gateway::admin::handle_add_key),
        )
        .route("/admin/keys/import", post(gateway::admin::handle_import_keys))
        .route("/admin/keys/{id}", delete(gateway::admin::handle_delete_key))
        .route(
            "/admin/keys/{id}/activate",
            post(gateway::admin::handle_activate_key),
        )
        .route("/admin/keys/{id}/sync", post(gateway::admin::handle_sync_key))
        .route("/admin/sync", post(gateway::admin::handle_sync_all))
        .route(
            "/admin/pricing",
            get(gateway::admin::handle_list_pricing).post(gateway::admin::handle_add_pricing),
        )
        .route(
            "/admin/pricing/check",
            get(gateway::admin::handle_check_price),
        )
        .route(
            "/admin/pricing/{id}",
            put(gateway::admin::handle_update_pricing)
                .delete(gateway::admin::handle_delete_pricing),
        )
        .route(
            "/admin/tokens",
            get(gateway::admin::handle_list_tokens).post(gateway::admin::handle_create_token),
        )
        .route(
            "/admin/tokens/{id}/toggle",
            post(gateway::admin::handle_toggle_token),
        )
        .route(
            "/admin/tokens/{id}",
            delete(gateway::admin::handle_delete_token),
        )
        .with_state(state.clone());

    // 受保护路由（需要认证）
    let protected_routes = Router::new()
        .merge(api_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::auth::require_auth,
        ));

    let app = Router::new().merge(public_routes).merge(protected_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_status(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let stats = state.store.stats().await;
    Json(serde_json::json!({
        "service": "api-exchange",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "keys": {
            "total": stats.total_keys,
            "active": stats.active_keys,
            "total_balance": stats.total_balance,
        },
    }))
}

fn init_tracing() {
    // DEBUG 只控制"客户端/后端详细日志块"，不关掉常规运行日志。
    // 依赖库日志默认压到 warn，本项目自身日志至少 info，
    // 以免环境中预设的 RUST_LOG=warn 把关键日志过滤掉。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,api_exchange=info")
    } else if env.contains("api_exchange") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},api_exchange=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
