use std::time::Duration;

/// 日志等级（由 DEBUG 环境变量控制）：
/// - off：不输出请求级详细日志
/// - low/client：输出客户端侧请求/响应
/// - medium/backend：再加上后端（上游）请求/响应
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Client = 1,
    Backend = 2,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Client,
            "medium" | "backend" | "high" | "all" => Self::Backend,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Client
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Backend
    }
}

/// Key 脱敏：任何日志里都不允许出现完整的上游密钥。
pub fn mask_secret(secret: &str) -> String {
    let s = secret.trim();
    if s.len() <= 11 || !s.is_ascii() {
        return "***".to_string();
    }
    format!("{}...{}", &s[..7], &s[s.len() - 4..])
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

const MAX_BODY_LOG_BYTES: usize = 2048;

fn format_body(body: &[u8]) -> String {
    if body.is_empty() {
        return "(空)".to_string();
    }
    let text = String::from_utf8_lossy(body);
    if text.len() > MAX_BODY_LOG_BYTES {
        let mut end = MAX_BODY_LOG_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...（截断，共 {} 字节）", &text[..end], body.len())
    } else {
        text.into_owned()
    }
}

pub fn client_request(method: &str, path: &str, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n{}\n=========================================================",
        format_body(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        format_body(body)
    );
}

pub fn backend_request(method: &str, url: &str, secret: &str, body_len: usize) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[Key] {}\n[请求体] {body_len} 字节\n=========================================================",
        mask_secret(secret)
    );
}

pub fn backend_response(status: u16, duration: Duration, body_len: usize) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms {body_len} 字节\n=========================================================",
        status,
        format_duration_ms(duration)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse(""), LogLevel::Off);
        assert_eq!(LogLevel::parse("LOW"), LogLevel::Client);
        assert_eq!(LogLevel::parse("client"), LogLevel::Client);
        assert_eq!(LogLevel::parse("medium"), LogLevel::Backend);
        assert_eq!(LogLevel::parse("all"), LogLevel::Backend);

        assert!(LogLevel::Backend.client_enabled());
        assert!(!LogLevel::Client.backend_enabled());
    }

    #[test]
    fn mask_secret_never_reveals_full_key() {
        let masked = mask_secret("sk-1234567890abcdef");
        assert_eq!(masked, "sk-1234...cdef");
        assert!(!masked.contains("1234567890abcdef"));

        // 短 Key 全部隐藏，避免掐头去尾后反而泄露。
        assert_eq!(mask_secret("sk-short"), "***");
        assert_eq!(mask_secret(""), "***");
    }
}
