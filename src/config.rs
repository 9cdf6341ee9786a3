use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_ADMIN_KEY: &str = "sk-api-exchange-admin";
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api2.qiandao.mom/v1";
const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_SYNC_BATCH_SIZE: usize = 5;
const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// 统一的访问密钥：既是管理接口密钥，也可直接作为网关 API Key 使用。
    pub admin_key: String,

    pub upstream_base_url: String,
    /// 账单接口基址；留空时由 upstream_base_url 去掉尾部 /v1 推导。
    pub billing_base_url: String,

    pub timeout_ms: u64,
    pub max_retries: usize,
    pub proxy: String,

    pub auto_sync: bool,
    pub sync_interval_secs: u64,
    pub sync_batch_size: usize,

    pub data_dir: String,
    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "ADMIN_KEY")]
    admin_key: Option<String>,

    #[serde(alias = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,
    #[serde(alias = "BILLING_BASE_URL")]
    billing_base_url: Option<String>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "MAX_RETRIES")]
    max_retries: Option<usize>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "AUTO_SYNC")]
    auto_sync: Option<bool>,
    #[serde(alias = "SYNC_INTERVAL")]
    sync_interval: Option<u64>,
    #[serde(alias = "SYNC_BATCH_SIZE")]
    sync_batch_size: Option<usize>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            admin_key: raw
                .admin_key
                .unwrap_or_else(|| DEFAULT_ADMIN_KEY.to_string()),
            upstream_base_url: raw
                .upstream_base_url
                .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string()),
            billing_base_url: raw.billing_base_url.unwrap_or_default(),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            max_retries: raw.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            proxy: raw.proxy.unwrap_or_default(),
            auto_sync: raw.auto_sync.unwrap_or(true),
            sync_interval_secs: raw.sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
            sync_batch_size: raw
                .sync_batch_size
                .unwrap_or(DEFAULT_SYNC_BATCH_SIZE)
                .max(1),
            data_dir: raw.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    /// 账单接口基址：未显式配置时去掉上游基址尾部的 /v1。
    pub fn effective_billing_base(&self) -> String {
        let v = self.billing_base_url.trim().trim_end_matches('/');
        if !v.is_empty() {
            return v.to_string();
        }
        let base = self.upstream_base_url.trim().trim_end_matches('/');
        base.strip_suffix("/v1").unwrap_or(base).to_string()
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    /// 测试用配置：指向桩服务，关闭后台同步。
    #[cfg(test)]
    pub fn for_tests(upstream_base_url: &str) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            admin_key: DEFAULT_ADMIN_KEY.to_string(),
            upstream_base_url: upstream_base_url.to_string(),
            billing_base_url: String::new(),
            timeout_ms: 5_000,
            max_retries: DEFAULT_MAX_RETRIES,
            proxy: String::new(),
            auto_sync: false,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            sync_batch_size: DEFAULT_SYNC_BATCH_SIZE,
            data_dir: String::new(),
            debug: "off".to_string(),
        }
    }
}

fn load_dotenv() {
    let Ok(file) = std::fs::File::open(".env") else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), raw.to_string()))
}
