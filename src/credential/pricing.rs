//! 模型计费解析：大小写不敏感的通配符匹配，按规则 id 顺序取首个命中。

use crate::credential::types::PricingRule;
use globset::GlobBuilder;

/// 无任何规则命中时的兜底价格（规则表为空时也适用）。
pub const DEFAULT_PRICE: f64 = 0.08;

/// 判断模型 id 是否命中规则的通配符模式。
///
/// 模式写错（无法编译成 glob）时按不命中处理，保证解析永不失败。
pub fn pattern_matches(pattern: &str, model: &str) -> bool {
    let Ok(glob) = GlobBuilder::new(pattern.trim())
        .case_insensitive(true)
        .build()
    else {
        return false;
    };
    glob.compile_matcher().is_match(model.trim())
}

/// 解析模型单次请求价格。规则需已按 id 升序排列。
pub fn resolve_price(rules: &[PricingRule], model: &str) -> f64 {
    for rule in rules {
        if pattern_matches(&rule.pattern, model) {
            return rule.price_per_request;
        }
    }
    DEFAULT_PRICE
}

/// 首次启动时写入的默认计费规则，末尾必须保留 `*` 兜底规则。
pub fn default_rules() -> Vec<(&'static str, f64, &'static str)> {
    vec![
        ("gemini-3-pro-*", 0.08, "Gemini 3 Pro 系列"),
        ("gemini-3-flash-*", 0.05, "Gemini 3 Flash 系列"),
        ("gemini-2.5-pro-*", 0.07, "Gemini 2.5 Pro 系列"),
        ("gemini-2.5-flash-*", 0.04, "Gemini 2.5 Flash 系列"),
        ("claude-opus-*", 0.12, "Claude Opus 系列"),
        ("claude-sonnet-*", 0.08, "Claude Sonnet 系列"),
        ("GPT-5*", 0.10, "GPT-5 系列"),
        ("DeepSeek-R1*", 0.06, "DeepSeek R1 推理模型"),
        ("DeepSeek-V*", 0.05, "DeepSeek V 系列"),
        ("*", 0.08, "默认价格（其他模型）"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: u64, pattern: &str, price: f64) -> PricingRule {
        PricingRule {
            id,
            pattern: pattern.to_string(),
            price_per_request: price,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn first_match_wins_in_rule_order() {
        let rules = vec![rule(1, "gemini-3-pro-*", 0.08), rule(2, "*", 0.03)];
        assert_eq!(resolve_price(&rules, "gemini-3-pro-preview-y"), 0.08);
        assert_eq!(resolve_price(&rules, "unknown-model"), 0.03);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let rules = vec![rule(1, "GPT-5*", 0.10)];
        assert_eq!(resolve_price(&rules, "gpt-5-turbo"), 0.10);

        let rules = vec![rule(1, "claude-opus-*", 0.12)];
        assert_eq!(resolve_price(&rules, "Claude-Opus-4"), 0.12);
    }

    #[test]
    fn empty_table_falls_back_to_default_price() {
        assert_eq!(resolve_price(&[], "gemini-3-pro-preview-y"), DEFAULT_PRICE);
        assert_eq!(resolve_price(&[], "anything"), DEFAULT_PRICE);
    }

    #[test]
    fn unmatched_model_falls_back_to_default_price() {
        let rules = vec![rule(1, "gemini-3-pro-*", 0.02)];
        assert_eq!(resolve_price(&rules, "unknown-model"), DEFAULT_PRICE);
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let rules = vec![rule(1, "claude-[", 0.99), rule(2, "*", 0.05)];
        assert_eq!(resolve_price(&rules, "claude-sonnet"), 0.05);
    }

    #[test]
    fn default_rules_end_with_catch_all() {
        let rules = default_rules();
        assert_eq!(rules.last().map(|r| r.0), Some("*"));
    }
}
