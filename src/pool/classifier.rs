//! 上游错误分类：对错误响应体做关键字匹配，决定故障转移策略。
//!
//! 这是尽力而为的字符串匹配，不感知上游协议；漏判只会让一个失效 Key
//! 留在池里，直到余额同步把它纠正过来。

/// 分类结果决定网关的后续动作：
/// - `Exhausted` / `Invalid`：标记该 Key 并换下一个重试
/// - `Transient`：不动 Key 状态，把上游错误原样交还调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Exhausted,
    Invalid,
    Transient,
}

/// 额度耗尽类关键字（含上游实际会返回的中文提示）。
const EXHAUSTED_KEYWORDS: &[&str] = &[
    "quota",
    "limit",
    "exceeded",
    "exhausted",
    "no remaining",
    "insufficient",
    "rate limit",
    "用完",
    "余额",
    "次数",
];

/// 认证失败类关键字。
const INVALID_KEYWORDS: &[&str] = &[
    "invalid",
    "unauthorized",
    "authentication",
    "invalid api key",
    "invalid_api_key",
    "无效",
];

/// 先查耗尽类再查认证类；"rate limit invalid" 这类同时命中的文本按耗尽处理。
pub fn classify(body: &str) -> ErrorKind {
    let lower = body.to_lowercase();

    if EXHAUSTED_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return ErrorKind::Exhausted;
    }
    if INVALID_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return ErrorKind::Invalid;
    }
    ErrorKind::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_body_is_exhausted() {
        assert_eq!(
            classify(r#"{"error":{"message":"Rate limit exceeded, try later"}}"#),
            ErrorKind::Exhausted
        );
        assert_eq!(classify("Insufficient quota"), ErrorKind::Exhausted);
        assert_eq!(classify("No remaining credits"), ErrorKind::Exhausted);
    }

    #[test]
    fn cjk_exhaustion_keywords_are_recognized() {
        assert_eq!(classify("该 Key 额度已用完"), ErrorKind::Exhausted);
        assert_eq!(classify("余额不足，请充值"), ErrorKind::Exhausted);
        assert_eq!(classify("调用次数超出"), ErrorKind::Exhausted);
    }

    #[test]
    fn auth_failure_body_is_invalid() {
        assert_eq!(classify("Invalid API Key"), ErrorKind::Invalid);
        assert_eq!(classify("unauthorized"), ErrorKind::Invalid);
        assert_eq!(classify("Authentication failed"), ErrorKind::Invalid);
        assert_eq!(classify("密钥无效"), ErrorKind::Invalid);
    }

    #[test]
    fn exhaustion_takes_precedence_over_invalid() {
        // 同时出现两类关键字时按耗尽处理（先换 Key，留给同步兜底）。
        assert_eq!(
            classify("invalid request: rate limit exceeded"),
            ErrorKind::Exhausted
        );
    }

    #[test]
    fn unrecognized_body_is_transient() {
        assert_eq!(classify("internal server error"), ErrorKind::Transient);
        assert_eq!(classify(""), ErrorKind::Transient);
    }

    #[test]
    fn matching_ignores_case() {
        assert_eq!(classify("RATE LIMIT EXCEEDED"), ErrorKind::Exhausted);
        assert_eq!(classify("INVALID_API_KEY"), ErrorKind::Invalid);
    }
}
