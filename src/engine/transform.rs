// ==========================================
// 批量迁移引擎 - 字段转换
// ==========================================
// 职责: 命名的确定性字段转换（内置 + 自定义注册）
// 红线: 转换失败不得产出“近似值”，一律报错交给管线置空
// ==========================================

use crate::config::error::{ConfigError, ConfigResult};
use crate::engine::error::TransformError;
use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// 自定义转换
///
/// 实现必须是确定性的：同一输入永远得到同一输出
pub trait FieldTransform: Send + Sync {
    fn apply(&self, value: &Value) -> Result<Value, String>;
}

impl<F> FieldTransform for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn apply(&self, value: &Value) -> Result<Value, String> {
        self(value)
    }
}

/// 内置转换名
pub const BUILTIN_TRANSFORMS: &[&str] = &[
    "normalize_phone",
    "normalize_email",
    "normalize_date",
    "normalize_boolean",
    "normalize_numeric",
    "normalize_currency",
    "normalize_uom",
    "clean_whitespace",
    "uppercase",
    "lowercase",
    "titlecase",
    "strip_html",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%m-%d-%Y", "%Y/%m/%d", "%d.%m.%Y",
    "%d %b %Y", "%d %B %Y", "%Y%m%d",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const TRUE_VALUES: &[&str] = &[
    "true", "yes", "1", "y", "t", "si", "sí", "oui", "ja", "on", "是",
];
const FALSE_VALUES: &[&str] = &["false", "no", "0", "n", "f", "non", "nein", "off", "否"];

const UOM_ALIASES: &[(&str, &str)] = &[
    ("pcs", "Units"),
    ("pc", "Units"),
    ("piece", "Units"),
    ("pieces", "Units"),
    ("unit", "Units"),
    ("units", "Units"),
    ("ea", "Units"),
    ("each", "Units"),
    ("kg", "kg"),
    ("kgs", "kg"),
    ("kilogram", "kg"),
    ("kilograms", "kg"),
    ("g", "g"),
    ("gram", "g"),
    ("grams", "g"),
    ("lb", "lb"),
    ("lbs", "lb"),
    ("pound", "lb"),
    ("pounds", "lb"),
    ("in", "inch"),
    ("inch", "inch"),
    ("inches", "inch"),
    ("m", "m"),
    ("meter", "m"),
    ("meters", "m"),
    ("metre", "m"),
    ("cm", "cm"),
    ("l", "Liters"),
    ("liter", "Liters"),
    ("liters", "Liters"),
    ("litre", "Liters"),
    ("litres", "Liters"),
    ("ml", "ml"),
    ("h", "Hours"),
    ("hr", "Hours"),
    ("hrs", "Hours"),
    ("hour", "Hours"),
    ("hours", "Hours"),
    ("d", "Days"),
    ("day", "Days"),
    ("days", "Days"),
];

// ==========================================
// TransformRegistry - 转换注册表
// ==========================================
pub struct TransformRegistry {
    default_country_code: String,
    email: Regex,
    html_tag: Regex,
    custom: HashMap<String, Arc<dyn FieldTransform>>,
}

impl TransformRegistry {
    pub fn new(default_country_code: &str) -> ConfigResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                model: "*".to_string(),
                field: "*".to_string(),
                message: e.to_string(),
            })
        };

        Ok(Self {
            default_country_code: default_country_code.trim().to_string(),
            email: compile(EMAIL_PATTERN)?,
            html_tag: compile(r"<[^>]+>")?,
            custom: HashMap::new(),
        })
    }

    /// 注册自定义转换（同名覆盖内置）
    pub fn register(&mut self, name: impl Into<String>, transform: Arc<dyn FieldTransform>) {
        self.custom.insert(name.into(), transform);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.custom.contains_key(name) || BUILTIN_TRANSFORMS.contains(&name)
    }

    /// 执行命名转换，Null 原样返回
    pub fn apply(&self, name: &str, value: &Value) -> Result<Value, TransformError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let result = match self.custom.get(name) {
            Some(custom) => custom.apply(value),
            None => self.apply_builtin(name, value),
        };

        result.map_err(|message| TransformError {
            transform: name.to_string(),
            value: display_text(value),
            message,
        })
    }

    fn apply_builtin(&self, name: &str, value: &Value) -> Result<Value, String> {
        let text = display_text(value);
        match name {
            "normalize_phone" => normalize_phone(&text, &self.default_country_code),
            "normalize_email" => {
                let email = text.trim().to_lowercase();
                if self.email.is_match(&email) {
                    Ok(Value::String(email))
                } else {
                    Err("邮箱格式无效".to_string())
                }
            }
            "normalize_date" => normalize_date(&text),
            "normalize_boolean" => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                _ => normalize_boolean(&text),
            },
            "normalize_numeric" | "normalize_currency" => match value {
                Value::Number(n) => Ok(Value::Number(n.clone())),
                _ => normalize_numeric(&text),
            },
            "normalize_uom" => Ok(string_or_null(normalize_uom(&text))),
            "clean_whitespace" => Ok(string_or_null(collapse_whitespace(&text))),
            "uppercase" => Ok(string_or_null(text.trim().to_uppercase())),
            "lowercase" => Ok(string_or_null(text.trim().to_lowercase())),
            "titlecase" => Ok(string_or_null(titlecase(&text))),
            "strip_html" => {
                let stripped = self.html_tag.replace_all(&text, " ");
                Ok(string_or_null(collapse_whitespace(&decode_entities(&stripped))))
            }
            other => Err(format!("未注册的转换: {}", other)),
        }
    }
}

pub const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";

/// 值的文本形式（字符串不加引号）
pub fn display_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_or_null(s: String) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s)
    }
}

/// 合并连续空白并去除首尾空白
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn titlecase(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_phone(text: &str, country_code: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err("电话号码不含数字".to_string());
    }

    let normalized = if trimmed.starts_with('+') || digits.len() > 10 {
        format!("+{}", digits)
    } else {
        format!("{}{}", country_code, digits)
    };
    Ok(Value::String(normalized))
}

fn normalize_date(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(Value::String(date.format("%Y-%m-%d").to_string()));
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(Value::String(dt.date().format("%Y-%m-%d").to_string()));
        }
    }
    Err("无法识别的日期格式".to_string())
}

fn normalize_boolean(text: &str) -> Result<Value, String> {
    let lowered = text.trim().to_lowercase();
    if TRUE_VALUES.contains(&lowered.as_str()) {
        Ok(Value::Bool(true))
    } else if FALSE_VALUES.contains(&lowered.as_str()) {
        Ok(Value::Bool(false))
    } else {
        Err("无法识别的布尔值".to_string())
    }
}

/// 数值归一化
///
/// 同时出现 , 和 . 时，靠后的一个是小数点；
/// 只有 , 时，恰好一个且其后不是三位数字视为小数点，否则为千分位。
fn normalize_numeric(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    let negative_parens = trimmed.starts_with('(') && trimmed.ends_with(')');
    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();

    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return Err("不含数字".to_string());
    }

    let last_comma = kept.rfind(',');
    let last_dot = kept.rfind('.');
    let canonical = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => kept.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => kept.replace(',', ""),
        (Some(c), None) => {
            let decimals = kept.len() - c - 1;
            if kept.matches(',').count() == 1 && decimals != 3 {
                kept.replace(',', ".")
            } else {
                kept.replace(',', "")
            }
        }
        (None, _) => kept.clone(),
    };

    let has_decimal = canonical.contains('.');
    let mut number: f64 = canonical
        .parse()
        .map_err(|_| format!("无法解析数值: {}", trimmed))?;
    if negative_parens {
        number = -number.abs();
    }

    if !has_decimal && number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        return Ok(Value::Number(Number::from(number as i64)));
    }
    Number::from_f64(number)
        .map(Value::Number)
        .ok_or_else(|| format!("数值不是有限数: {}", trimmed))
}

fn normalize_uom(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    UOM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| titlecase(text))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
