//! 行程参数与各类确定性键
//!
//! - **ItineraryKey**：只含日期、人数、币种、地区，跨搜索页/详情页会话匹配同一行程
//! - **RequestFingerprint**：缓存、去重、结果质量追踪使用的请求指纹，以会话 ID 为前缀
//! - **throttle key**：手动刷新冷却使用的键，优先 booking URL

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 会话 ID（如浏览器标签页），不透明字符串
pub type SessionId = String;

/// 未提供或非法时的默认币种
pub const DEFAULT_CURRENCY: &str = "USD";
/// 未提供时的默认地区
pub const DEFAULT_GEO_LOCALE: &str = "us";
/// 未提供时的默认入住人数
pub const DEFAULT_ADULTS: u32 = 2;

/// 行程参数（页面上下文的核心部分）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItineraryParams {
    #[serde(default)]
    pub hotel_name: String,
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
    pub adults: Option<u32>,
    pub currency: Option<String>,
    pub geo_locale: Option<String>,
    pub host_locale: Option<String>,
    /// 官方网站 URL（hint），通常在首次比价之后才到达
    pub official_url: Option<String>,
    pub booking_url: Option<String>,
    #[serde(default)]
    pub smart_mode: bool,
}

impl ItineraryParams {
    /// 3 位字母大写币种，非法时回落 USD
    pub fn normalized_currency(&self) -> String {
        normalize_currency(self.currency.as_deref())
    }

    pub fn normalized_geo_locale(&self) -> String {
        normalize_geo_locale(self.geo_locale.as_deref())
    }

    pub fn normalized_host_locale(&self) -> String {
        normalize_host_locale(self.host_locale.as_deref())
    }

    pub fn adults_or_default(&self) -> u32 {
        match self.adults {
            Some(n) if n > 0 => n,
            _ => DEFAULT_ADULTS,
        }
    }

    pub fn has_dates(&self) -> bool {
        self.check_in.is_some() && self.check_out.is_some()
    }

    /// 返回归一化后的副本（币种、地区、语言、人数）
    pub fn normalized(&self) -> Self {
        Self {
            hotel_name: self.hotel_name.trim().to_string(),
            adults: Some(self.adults_or_default()),
            currency: Some(self.normalized_currency()),
            geo_locale: Some(self.normalized_geo_locale()),
            host_locale: Some(self.normalized_host_locale()),
            official_url: non_empty(self.official_url.as_deref()),
            booking_url: non_empty(self.booking_url.as_deref()),
            ..self.clone()
        }
    }

    /// 官方 URL 的域名（去掉 www.），无 hint 时为空串
    pub fn official_domain(&self) -> String {
        self.official_url
            .as_deref()
            .map(domain_of)
            .unwrap_or_default()
    }

    pub fn without_hint(&self) -> Self {
        Self {
            official_url: None,
            ..self.clone()
        }
    }
}

/// 局部覆盖（get-compare-data / refresh-compare 携带）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItineraryOverrides {
    pub hotel_name: Option<String>,
    pub check_in: Option<NaiveDate>,
    pub check_out: Option<NaiveDate>,
    pub adults: Option<u32>,
    pub currency: Option<String>,
    pub geo_locale: Option<String>,
    pub host_locale: Option<String>,
    pub official_url: Option<String>,
    pub booking_url: Option<String>,
    pub smart_mode: Option<bool>,
}

impl ItineraryOverrides {
    pub fn apply(&self, base: &ItineraryParams) -> ItineraryParams {
        ItineraryParams {
            hotel_name: self.hotel_name.clone().unwrap_or_else(|| base.hotel_name.clone()),
            check_in: self.check_in.or(base.check_in),
            check_out: self.check_out.or(base.check_out),
            adults: self.adults.or(base.adults),
            currency: self.currency.clone().or_else(|| base.currency.clone()),
            geo_locale: self.geo_locale.clone().or_else(|| base.geo_locale.clone()),
            host_locale: self.host_locale.clone().or_else(|| base.host_locale.clone()),
            official_url: self.official_url.clone().or_else(|| base.official_url.clone()),
            booking_url: self.booking_url.clone().or_else(|| base.booking_url.clone()),
            smart_mode: self.smart_mode.unwrap_or(base.smart_mode),
        }
    }
}

pub fn normalize_currency(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(c) if c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
            c.to_ascii_uppercase()
        }
        _ => DEFAULT_CURRENCY.to_string(),
    }
}

pub fn normalize_geo_locale(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(g) if !g.is_empty() => g.to_lowercase(),
        _ => DEFAULT_GEO_LOCALE.to_string(),
    }
}

pub fn normalize_host_locale(raw: Option<&str>) -> String {
    raw.map(|h| h.trim().to_lowercase()).unwrap_or_default()
}

/// 提取 URL 的主机名；缺少 scheme 时按 https 补全再解析
pub fn domain_of(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() {
        return String::new();
    }
    let parsed = reqwest::Url::parse(url).or_else(|_| reqwest::Url::parse(&format!("https://{url}")));
    match parsed.ok().and_then(|u| u.host_str().map(str::to_lowercase)) {
        Some(host) => host.strip_prefix("www.").map(str::to_string).unwrap_or(host),
        None => String::new(),
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn date_str(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_default()
}

fn normalize_hotel_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 行程键：`{checkIn}:{checkOut}:{adults}:{currency}:{geo}:{hostLocale}`
///
/// 不含酒店名等自由文本，搜索页与详情页的同一行程得到同一个键。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItineraryKey(String);

impl ItineraryKey {
    pub fn from_params(params: &ItineraryParams) -> Self {
        Self(format!(
            "{}:{}:{}:{}:{}:{}",
            date_str(params.check_in),
            date_str(params.check_out),
            params.adults_or_default(),
            params.normalized_currency(),
            params.normalized_geo_locale(),
            params.normalized_host_locale(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItineraryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 请求指纹；首段固定为会话 ID
///
/// 会话 ID 单独保存，按会话清理时精确比较，不依赖字符串前缀。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestFingerprint {
    session_id: SessionId,
    key: String,
}

impl RequestFingerprint {
    pub fn new(session_id: &str, params: &ItineraryParams) -> Self {
        Self {
            session_id: session_id.to_string(),
            key: format!(
                "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
                session_id,
                normalize_hotel_name(&params.hotel_name),
                date_str(params.check_in),
                date_str(params.check_out),
                params.adults_or_default(),
                params.normalized_currency(),
                params.normalized_geo_locale(),
                params.normalized_host_locale(),
                params.official_domain(),
                if params.smart_mode { "smart" } else { "plain" },
            ),
        }
    }

    /// 不含官方 URL hint 的指纹：结果质量记录按它存放，hint 到达后仍能找到
    pub fn family(session_id: &str, params: &ItineraryParams) -> Self {
        Self::new(session_id, &params.without_hint())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id == session_id
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// 手动刷新节流键：优先 booking URL，否则由地区/酒店/日期/人数/币种拼接
pub fn throttle_key(params: &ItineraryParams) -> String {
    if let Some(url) = non_empty(params.booking_url.as_deref()) {
        return url;
    }
    format!(
        "{}|{}|{}|{}|{}|{}",
        params.normalized_geo_locale(),
        normalize_hotel_name(&params.hotel_name),
        date_str(params.check_in),
        date_str(params.check_out),
        params.adults_or_default(),
        params.normalized_currency(),
    )
}
