//! REST-клиент backend Courier.
//!
//! Ошибки backend пробрасываются как [`CourierError::Api`] с HTTP-статусом
//! и текстом из поля `error` ответа. Если текста нет, используется
//! сообщение по умолчанию для конкретного вызова.

use crate::config::{ClientSettings, HTTP_TIMEOUT_SECS};
use commons::errors::CourierError;
use commons::models::{Location, OrderRecord, OrderStatus, ServiceType, TrackedOrder};
use commons::traits::OrderSource;
use log::{debug, error, info, warn};
use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const ESTIMATE_FAILED: &str = "Failed to calculate estimate";
const TRACK_FAILED: &str = "Failed to fetch order status";
const HISTORY_FAILED: &str = "Failed to fetch order history";
const CANCEL_FAILED: &str = "Failed to cancel order";
const INVALID_ESTIMATE: &str = "Invalid response from backend: missing distance or price";

/// Вес посылки, если клиент его не указал.
pub const DEFAULT_WEIGHT_KG: f64 = 1.0;

/// Получатель-заглушка для публичного расчёта.
const GUEST_NAME: &str = "Guest User";
const GUEST_PHONE: &str = "0000000000";
const GUEST_DESCRIPTION: &str = "Quotation estimate";

/// Запрос расчёта стоимости для авторизованного клиента.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub pickup_address: String,
    pub delivery_address: String,
    pub weight: f64,
    pub service_type: ServiceType,
    pub include_trailer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_wallet: Option<bool>,
}

impl EstimateRequest {
    pub fn new(
        pickup_address: impl Into<String>,
        delivery_address: impl Into<String>,
        service_type: ServiceType,
    ) -> Self {
        Self {
            pickup_address: pickup_address.into(),
            delivery_address: delivery_address.into(),
            weight: DEFAULT_WEIGHT_KG,
            service_type,
            include_trailer: false,
            description: None,
            recipient_name: None,
            recipient_phone: None,
            recipient_email: None,
            delivery_notes: None,
            preferred_time: None,
            use_wallet: None,
        }
    }

    /// Вес в кг. Отсутствующий или нулевой вес заменяется на 1 кг.
    pub fn weight(mut self, weight: Option<f64>) -> Self {
        self.weight = normalize_weight(weight);
        self
    }

    pub fn with_trailer(mut self, include_trailer: bool) -> Self {
        self.include_trailer = include_trailer;
        self
    }

    pub fn recipient(mut self, name: impl Into<String>, phone: impl Into<String>) -> Self {
        self.recipient_name = Some(name.into());
        self.recipient_phone = Some(phone.into());
        self
    }
}

/// Запрос публичного расчёта (без авторизации).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublicEstimateRequest {
    pub pickup_address: String,
    pub delivery_address: String,
    pub weight: Option<f64>,
    pub service_type: String,
}

/// Тело публичного расчёта в формате backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicEstimatePayload {
    pickup_address: String,
    delivery_address: String,
    weight: f64,
    service_type: String,
    recipient_name: &'static str,
    recipient_phone: &'static str,
    description: &'static str,
}

impl PublicEstimateRequest {
    /// Проверить обязательные поля и собрать тело запроса.
    ///
    /// Адреса обрезаются, тип услуги приводится к написанию backend.
    fn to_payload(&self) -> Result<PublicEstimatePayload, CourierError> {
        let pickup = self.pickup_address.trim();
        let delivery = self.delivery_address.trim();
        let service = self.service_type.trim();
        if pickup.is_empty() || delivery.is_empty() || service.is_empty() {
            return Err(CourierError::value_err(
                "Missing required fields: pickupAddress, deliveryAddress, and serviceType are required",
            ));
        }

        let service_type = match service.parse::<ServiceType>() {
            Ok(known) => known.to_string(),
            Err(_) => service.to_uppercase(),
        };

        Ok(PublicEstimatePayload {
            pickup_address: pickup.to_string(),
            delivery_address: delivery.to_string(),
            weight: normalize_weight(self.weight),
            service_type,
            recipient_name: GUEST_NAME,
            recipient_phone: GUEST_PHONE,
            description: GUEST_DESCRIPTION,
        })
    }
}

fn normalize_weight(weight: Option<f64>) -> f64 {
    match weight {
        Some(w) if w.is_finite() && w > 0.0 => w,
        _ => DEFAULT_WEIGHT_KG,
    }
}

/// Ответ backend на расчёт стоимости.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResponse {
    distance_km: Option<f64>,
    price: Option<f64>,
    base_fee: Option<f64>,
    trailer_fee: Option<f64>,
    error: Option<String>,
}

/// Расчёт стоимости от backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Estimate {
    pub distance_km: f64,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailer_fee: Option<f64>,
}

impl TryFrom<EstimateResponse> for Estimate {
    type Error = CourierError;

    fn try_from(response: EstimateResponse) -> Result<Self, Self::Error> {
        if let Some(message) = response.error {
            return Err(CourierError::api_err(400, message));
        }
        match (response.distance_km, response.price) {
            (Some(distance_km), Some(price)) => Ok(Estimate {
                distance_km,
                price,
                base_fee: response.base_fee,
                trailer_fee: response.trailer_fee,
            }),
            _ => Err(CourierError::api_err(500, INVALID_ESTIMATE)),
        }
    }
}

/// Ответ на запрос статуса заказа.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    tracking_number: Option<String>,
    status: String,
    #[serde(default)]
    current_location: Option<Location>,
}

impl TrackResponse {
    fn into_tracked(self, requested: &str) -> Result<TrackedOrder, CourierError> {
        let status = self
            .status
            .parse::<OrderStatus>()
            .map_err(|_| CourierError::InvalidStatus(self.status.clone()))?;
        let tracking_number = self
            .tracking_number
            .filter(|tn| !tn.trim().is_empty())
            .unwrap_or_else(|| requested.to_string());

        let mut order = TrackedOrder::new(tracking_number, status);
        order.current_location = self.current_location;
        Ok(order)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// Клиент REST API backend.
#[derive(Debug, Clone)]
pub struct BackendApi {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl BackendApi {
    /// Клиент по настройкам окружения.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::Network`], если HTTP-клиент не удалось создать.
    pub fn new(settings: &ClientSettings) -> Result<Self, CourierError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CourierError::Network(err.to_string()))?;

        Ok(Self::with_client(
            client,
            settings.backend_url.clone(),
            settings.token.clone(),
        ))
    }

    pub fn with_client(client: Client, base_url: Url, token: Option<String>) -> Self {
        Self {
            client,
            base_url,
            token,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Расчёт стоимости для авторизованного клиента.
    pub fn estimate(&self, request: &EstimateRequest) -> Result<Estimate, CourierError> {
        if self.token.is_none() {
            return Err(CourierError::api_err(401, "Unauthorized"));
        }

        let url = self.endpoint(&["api", "orders", "estimate"])?;
        let body = self.execute(self.client.post(url).json(request), true, ESTIMATE_FAILED)?;
        let response: EstimateResponse = parse_json(&body)?;
        let estimate = Estimate::try_from(response)?;

        info!(
            "Расчёт: {} -> {}, {} км, {}",
            request.pickup_address, request.delivery_address, estimate.distance_km, estimate.price
        );
        Ok(estimate)
    }

    /// Публичный расчёт стоимости без авторизации.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::ValueError`], если не заполнены адреса или тип
    /// услуги (запрос при этом не отправляется).
    pub fn public_estimate(&self, request: &PublicEstimateRequest) -> Result<Estimate, CourierError> {
        let payload = request.to_payload()?;
        let url = self.endpoint(&["api", "orders", "public", "estimate"])?;
        let body = self.execute(self.client.post(url).json(&payload), false, ESTIMATE_FAILED)?;

        let response: EstimateResponse = parse_json(&body)?;
        let estimate = Estimate::try_from(response).inspect_err(|err| {
            warn!("Публичный расчёт отклонён: {}", err);
        })?;

        info!(
            "Публичный расчёт: {} км, {}",
            estimate.distance_km, estimate.price
        );
        Ok(estimate)
    }

    /// Текущее состояние заказа.
    pub fn track(&self, tracking_number: &str) -> Result<TrackedOrder, CourierError> {
        let tracking_number = tracking_number.trim();
        let url = self.endpoint(&["api", "orders", "track", tracking_number])?;
        let body = self.execute(self.client.get(url), true, TRACK_FAILED)?;

        let response: TrackResponse = parse_json(&body)?;
        let order = response.into_tracked(tracking_number)?;
        debug!("Снимок заказа: {}", order);
        Ok(order)
    }

    /// История заказов клиента.
    pub fn history(&self) -> Result<Vec<OrderRecord>, CourierError> {
        let url = self.endpoint(&["api", "orders", "history"])?;
        let body = self.execute(self.client.get(url), true, HISTORY_FAILED)?;

        let records: Vec<OrderRecord> = parse_json(&body)?;
        debug!("История: {} заказов", records.len());
        Ok(records)
    }

    /// Отменить заказ.
    pub fn cancel(&self, tracking_number: &str) -> Result<(), CourierError> {
        let tracking_number = tracking_number.trim();
        let url = self.endpoint(&["api", "orders", "cancel", tracking_number])?;
        self.execute(self.client.post(url).json(&serde_json::json!({})), true, CANCEL_FAILED)?;

        info!("Заказ {} отменён", tracking_number);
        Ok(())
    }

    /// Адрес метода: сегменты добавляются к пути базового адреса.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CourierError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CourierError::value_err(format!("некорректный адрес backend: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Выполнить запрос и вернуть тело успешного ответа.
    fn execute(
        &self,
        request: RequestBuilder,
        authorized: bool,
        failure: &str,
    ) -> Result<String, CourierError> {
        let request = match (&self.token, authorized) {
            (Some(token), true) => request.bearer_auth(token),
            _ => request,
        };

        let response = request.send().map_err(|err| {
            error!("{}: {}", failure, err);
            CourierError::Network(format!("{}: {}", failure, err))
        })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| CourierError::Network(format!("{}: {}", failure, err)))?;

        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| failure.to_string());
        warn!("{}: HTTP {}: {}", failure, status.as_u16(), message);
        Err(CourierError::api_err(status.as_u16(), message))
    }
}

fn parse_json<T: DeserializeOwned>(body: &str) -> Result<T, CourierError> {
    Ok(serde_json::from_str(body)?)
}

impl OrderSource for BackendApi {
    fn fetch_order(&self, tracking_number: &str) -> Result<TrackedOrder, CourierError> {
        self.track(tracking_number)
    }

    fn order_history(&self) -> Result<Vec<OrderRecord>, CourierError> {
        self.history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Принятый сервером запрос.
    #[derive(Debug)]
    struct Captured {
        request_line: String,
        headers: Vec<String>,
        body: String,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<String> {
            let prefix = format!("{}:", name.to_lowercase());
            self.headers
                .iter()
                .find(|h| h.to_lowercase().starts_with(&prefix))
                .map(|h| h[prefix.len()..].trim().to_string())
        }

        fn json(&self) -> serde_json::Value {
            serde_json::from_str(&self.body).unwrap()
        }
    }

    /// Поднять HTTP-сервер на один запрос с заданным ответом.
    fn serve_once(status: u16, body: &str) -> (Url, JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let body = body.to_string();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut headers = Vec::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                headers.push(line);
            }
            let length = headers
                .iter()
                .find_map(|h| {
                    h.to_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            let mut raw = vec![0u8; length];
            reader.read_exact(&mut raw).unwrap();

            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let mut stream = stream;
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();

            Captured {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: String::from_utf8(raw).unwrap(),
            }
        });

        (Url::parse(&format!("http://{}", addr)).unwrap(), handle)
    }

    fn api(base_url: Url, token: Option<&str>) -> BackendApi {
        let client = Client::builder().no_proxy().build().unwrap();
        BackendApi::with_client(client, base_url, token.map(String::from))
    }

    #[test]
    fn estimate_sends_bearer_and_defaults() {
        let (url, server) = serve_once(200, r#"{"distanceKm":12.5,"price":152.0,"baseFee":100.0}"#);
        let request = EstimateRequest::new("1 Main Rd", "2 Side St", ServiceType::SameDay).weight(Some(0.0));

        let estimate = api(url, Some("jwt-1")).estimate(&request).unwrap();
        assert_eq!(estimate.price, 152.0);
        assert_eq!(estimate.base_fee, Some(100.0));

        let captured = server.join().unwrap();
        assert_eq!(captured.request_line, "POST /api/orders/estimate HTTP/1.1");
        assert_eq!(captured.header("authorization").as_deref(), Some("Bearer jwt-1"));
        let json = captured.json();
        assert_eq!(json["weight"], 1.0);
        assert_eq!(json["serviceType"], "SAME_DAY");
        assert_eq!(json["includeTrailer"], false);
        assert!(json.get("recipientName").is_none());
    }

    #[test]
    fn estimate_requires_token() {
        let api = api(Url::parse("http://127.0.0.1:9").unwrap(), None);
        let request = EstimateRequest::new("a", "b", ServiceType::Standard);
        assert!(matches!(
            api.estimate(&request),
            Err(CourierError::Api { status: 401, .. })
        ));
    }

    #[test]
    fn public_estimate_builds_guest_payload() {
        let (url, server) = serve_once(200, r#"{"distanceKm":3.0,"price":100.0}"#);
        let request = PublicEstimateRequest {
            pickup_address: "  1 Main Rd ".into(),
            delivery_address: "2 Side St".into(),
            weight: None,
            service_type: "same-day".into(),
        };

        let estimate = api(url, Some("ignored")).public_estimate(&request).unwrap();
        assert_eq!(estimate.distance_km, 3.0);

        let captured = server.join().unwrap();
        assert_eq!(captured.request_line, "POST /api/orders/public/estimate HTTP/1.1");
        assert!(captured.header("authorization").is_none());
        let json = captured.json();
        assert_eq!(json["pickupAddress"], "1 Main Rd");
        assert_eq!(json["serviceType"], "SAME_DAY");
        assert_eq!(json["recipientName"], "Guest User");
        assert_eq!(json["recipientPhone"], "0000000000");
        assert_eq!(json["description"], "Quotation estimate");
        assert_eq!(json["weight"], 1.0);
    }

    #[test]
    fn public_estimate_validates_locally() {
        let api = api(Url::parse("http://127.0.0.1:9").unwrap(), None);
        let request = PublicEstimateRequest {
            pickup_address: "1 Main Rd".into(),
            delivery_address: "   ".into(),
            weight: Some(2.0),
            service_type: "STANDARD".into(),
        };
        let err = api.public_estimate(&request).unwrap_err();
        assert!(err.to_string().contains("Missing required fields"));
    }

    #[test]
    fn unknown_service_is_upper_cased() {
        let request = PublicEstimateRequest {
            pickup_address: "a".into(),
            delivery_address: "b".into(),
            weight: Some(4.0),
            service_type: "overnight".into(),
        };
        let payload = request.to_payload().unwrap();
        assert_eq!(payload.service_type, "OVERNIGHT");
        assert_eq!(payload.weight, 4.0);
    }

    #[test]
    fn incomplete_estimate_is_rejected() {
        let (url, server) = serve_once(200, r#"{"distanceKm":3.0}"#);
        let request = PublicEstimateRequest {
            pickup_address: "a".into(),
            delivery_address: "b".into(),
            weight: None,
            service_type: "INSTANT".into(),
        };
        let err = api(url, None).public_estimate(&request).unwrap_err();
        server.join().unwrap();
        assert_eq!(err.to_string(), format!("{} (HTTP 500)", INVALID_ESTIMATE));
    }

    #[test]
    fn estimate_error_field_is_surfaced() {
        let (url, server) = serve_once(200, r#"{"error":"Address not found"}"#);
        let request = PublicEstimateRequest {
            pickup_address: "a".into(),
            delivery_address: "b".into(),
            weight: None,
            service_type: "INSTANT".into(),
        };
        let err = api(url, None).public_estimate(&request).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, CourierError::Api { message, .. } if message == "Address not found"));
    }

    #[test]
    fn backend_error_passes_through() {
        let (url, server) = serve_once(404, r#"{"error":"Order not found"}"#);
        let err = api(url, Some("jwt")).track("TMOF-404").unwrap_err();
        let captured = server.join().unwrap();

        assert_eq!(captured.request_line, "GET /api/orders/track/TMOF-404 HTTP/1.1");
        assert!(matches!(
            err,
            CourierError::Api { status: 404, ref message } if message == "Order not found"
        ));
    }

    #[test]
    fn default_message_without_error_body() {
        let (url, server) = serve_once(502, "<html>bad gateway</html>");
        let err = api(url, Some("jwt")).history().unwrap_err();
        server.join().unwrap();
        assert_eq!(err.to_string(), "Failed to fetch order history (HTTP 502)");
    }

    #[test]
    fn track_builds_snapshot() {
        let (url, server) = serve_once(
            200,
            r#"{"trackingNumber":"TMOF-9","status":"IN_TRANSIT","currentLocation":[-26.2,28.04]}"#,
        );
        let order = api(url, Some("jwt")).fetch_order(" TMOF-9 ").unwrap();
        server.join().unwrap();

        assert_eq!(order.tracking_number, "TMOF-9");
        assert_eq!(order.status, OrderStatus::InTransit);
        assert_eq!(
            order.current_location.and_then(|l| l.coordinates()),
            Some((-26.2, 28.04))
        );
    }

    #[test]
    fn unknown_status_is_reported() {
        let (url, server) = serve_once(200, r#"{"status":"LOST_IN_SPACE"}"#);
        let err = api(url, Some("jwt")).track("TMOF-1").unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, CourierError::InvalidStatus(s) if s == "LOST_IN_SPACE"));
    }

    #[test]
    fn history_parses_records() {
        let (url, server) = serve_once(
            200,
            r#"[{"id":7,"trackingNumber":"TMOF-7","status":"DELIVERED","price":152.0,"serviceType":"SAME_DAY"},
               {"id":8,"trackingNumber":"TMOF-8","status":"PENDING_PAYMENT"}]"#,
        );
        let records = api(url, Some("jwt")).order_history().unwrap();
        server.join().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].order_status(), Some(OrderStatus::Delivered));
        assert_eq!(records[0].price, 152.0);
        assert_eq!(records[1].order_status(), None);
    }

    #[test]
    fn cancel_posts_to_order_path() {
        let (url, server) = serve_once(200, "{}");
        api(url, Some("jwt")).cancel("TMOF-3").unwrap();
        let captured = server.join().unwrap();
        assert_eq!(captured.request_line, "POST /api/orders/cancel/TMOF-3 HTTP/1.1");
    }

    #[test]
    fn unreachable_backend_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
        drop(listener);

        let err = api(url, Some("jwt")).cancel("TMOF-3").unwrap_err();
        assert!(matches!(err, CourierError::Network(m) if m.starts_with("Failed to cancel order")));
    }
}
