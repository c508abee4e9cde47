//! Конфигурация Courier Client.

use commons::errors::CourierError;
use commons::utils::mask_secret;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use url::Url;

/// Название директории для log-файлов.
pub const LOG_FOLDER: &str = "log";

/// Адрес REST backend по умолчанию.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Адрес STOMP/WebSocket backend по умолчанию.
pub const DEFAULT_BACKEND_WS_URL: &str = "ws://localhost:8080/ws";

/// Переменная окружения с адресом REST backend.
pub const ENV_BACKEND_URL: &str = "BACKEND_URL";

/// Переменная окружения с адресом WebSocket backend.
pub const ENV_BACKEND_WS_URL: &str = "NEXT_PUBLIC_BACKEND_WS_URL";

/// Ключ Google Maps (используется интерфейсом карт).
pub const ENV_GOOGLE_MAPS_API_KEY: &str = "NEXT_PUBLIC_GOOGLE_MAPS_API_KEY";

/// Публичный ключ Paystack.
pub const ENV_PAYSTACK_PUBLIC_KEY: &str = "NEXT_PUBLIC_PAYSTACK_PUBLIC_KEY";

/// Переменная окружения с JWT клиента.
pub const ENV_JWT: &str = "COURIER_JWT";

/// Префикс топиков обновлений заказа: `/topic/order/{trackingNumber}`.
pub const ORDER_TOPIC_PREFIX: &str = "/topic/order/";

/// Интервал heart-beat STOMP (в обе стороны), мс.
pub const HEARTBEAT_MS: u64 = 4000;

/// Фиксированная задержка перед переподключением, мс.
pub const RECONNECT_DELAY_MS: u64 = 5000;

/// Ожидание фрейма `CONNECTED` после открытия сокета, мс.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Период опроса сокета и очереди команд рабочим потоком, мс.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Сколько CLI ждёт закрытия соединения перед выходом, мс.
pub const SHUTDOWN_WAIT_MS: u64 = 2000;

/// Таймаут HTTP-запросов к backend, сек.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Сформировать топик обновлений заказа.
pub fn order_topic(tracking_number: &str) -> String {
    format!("{}{}", ORDER_TOPIC_PREFIX, tracking_number.trim())
}

/// Параметры STOMP-сессии.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Адрес WebSocket-точки STOMP.
    pub ws_url: Url,
    /// JWT для заголовка `Authorization` фрейма `CONNECT`.
    pub token: Option<String>,
    /// Желаемый интервал heart-beat (исходящие и входящие).
    pub heartbeat: Duration,
    /// Задержка перед повторным подключением.
    pub reconnect_delay: Duration,
    /// Максимальное ожидание фрейма `CONNECTED`.
    pub handshake_timeout: Duration,
    /// Период опроса сокета.
    pub poll_interval: Duration,
}

impl SessionConfig {
    /// Параметры по умолчанию для указанного адреса.
    pub fn new(ws_url: Url, token: Option<String>) -> Self {
        Self {
            ws_url,
            token,
            heartbeat: Duration::from_millis(HEARTBEAT_MS),
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }

    /// Значение заголовка `host` фрейма `CONNECT`.
    pub fn host(&self) -> String {
        self.ws_url.host_str().unwrap_or("localhost").to_string()
    }
}

/// Настройки клиента, собранные из окружения.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Адрес REST backend.
    pub backend_url: Url,
    /// Адрес STOMP/WebSocket backend.
    pub ws_url: Url,
    /// JWT клиента, если он авторизован.
    pub token: Option<String>,
    pub google_maps_api_key: Option<String>,
    pub paystack_public_key: Option<String>,
}

impl ClientSettings {
    /// Прочитать настройки из переменных окружения.
    pub fn from_env() -> Result<Self, CourierError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Собрать настройки, получая значения через `lookup`.
    ///
    /// Пустые значения считаются отсутствующими.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CourierError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend_url = parse_url(
            ENV_BACKEND_URL,
            &get(ENV_BACKEND_URL).unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            &["http", "https"],
        )?;
        let ws_url = parse_url(
            ENV_BACKEND_WS_URL,
            &get(ENV_BACKEND_WS_URL).unwrap_or_else(|| DEFAULT_BACKEND_WS_URL.to_string()),
            &["ws", "wss"],
        )?;

        Ok(Self {
            backend_url,
            ws_url,
            token: get(ENV_JWT),
            google_maps_api_key: get(ENV_GOOGLE_MAPS_API_KEY),
            paystack_public_key: get(ENV_PAYSTACK_PUBLIC_KEY),
        })
    }

    /// Заменить JWT (например, переданный в командной строке).
    pub fn with_token(mut self, token: Option<String>) -> Self {
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.token = Some(token);
        }
        self
    }

    /// Параметры STOMP-сессии на основе настроек.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.ws_url.clone(), self.token.clone())
    }
}

impl Display for ClientSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let masked = |v: &Option<String>| v.as_deref().map(mask_secret).unwrap_or_else(|| "-".into());
        write!(
            f,
            "backend: {} | ws: {} | jwt: {} | maps: {} | paystack: {}",
            self.backend_url,
            self.ws_url,
            masked(&self.token),
            masked(&self.google_maps_api_key),
            masked(&self.paystack_public_key)
        )
    }
}

/// Разобрать адрес и проверить схему.
fn parse_url(key: &str, raw: &str, schemes: &[&str]) -> Result<Url, CourierError> {
    let url = Url::parse(raw)
        .map_err(|err| CourierError::value_err(format!("{key}: некорректный адрес '{raw}': {err}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(CourierError::value_err(format!(
            "{key}: схема '{}' не поддерживается (ожидается {})",
            url.scheme(),
            schemes.join("/")
        )));
    }
    Ok(url)
}
