// ==========================================
// 国际化 (i18n) 模块
// ==========================================
// 使用 rust-i18n 库
// 支持中文（默认）和英文
// ==========================================
// 注意: rust_i18n::i18n! 宏已在 lib.rs 中初始化
// ==========================================

/// 支持的语言
pub const SUPPORTED_LOCALES: &[&str] = &["zh-CN", "en"];

/// 获取当前语言
pub fn current_locale() -> String {
    rust_i18n::locale().to_string()
}

/// 设置语言
///
/// # 参数
/// - locale: 语言代码（"zh-CN" 或 "en"）
pub fn set_locale(locale: &str) {
    rust_i18n::set_locale(locale);
}

/// 是否为支持的语言
pub fn is_supported(locale: &str) -> bool {
    SUPPORTED_LOCALES.contains(&locale)
}

/// 翻译消息（无参数）
///
/// # 示例
/// ```no_run
/// use bulk_migrator::i18n::t;
/// let msg = t("summary.title");
/// ```
pub fn t(key: &str) -> String {
    rust_i18n::t!(key).to_string()
}

fn fill_args(mut text: String, args: &[(&str, &str)]) -> String {
    for (k, v) in args {
        let placeholder = format!("%{{{}}}", k);
        text = text.replace(&placeholder, v);
    }
    text
}

/// 翻译消息（带参数）
///
/// # 示例
/// ```no_run
/// use bulk_migrator::i18n::t_with_args;
/// let msg = t_with_args("summary.total", &[("count", "42")]);
/// ```
pub fn t_with_args(key: &str, args: &[(&str, &str)]) -> String {
    fill_args(rust_i18n::t!(key).to_string(), args)
}

/// 按指定语言翻译（不修改全局语言）
pub fn t_in(locale: &str, key: &str, args: &[(&str, &str)]) -> String {
    fill_args(rust_i18n::t!(key, locale = locale).to_string(), args)
}
