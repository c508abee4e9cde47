//! Локальный тарифный калькулятор.
//!
//! Детерминированно рассчитывает стоимость доставки по типу услуги,
//! расстоянию, весу и времени суток, без сетевых обращений. Используется
//! как мгновенная оценка до ответа backend.
//!
//! Порядок расчёта: базовая цена, доплата за расстояние, за вес, сервисный
//! сбор, затем пиковый множитель на сумму всех четырёх (кроме
//! [`ServiceType::Standard`]). Надбавка за прицеп добавляется после
//! множителя.
//!
//! Внутри расчёта округления нет: суммы округляются до копеек только при
//! выводе (см. [`crate::utils::format_currency`]).
//!
//! ## Пример
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use commons::pricing::{calculate_quote, QuoteRequest};
//!
//! // Среда, 10:00, вне часа пик.
//! let at = Utc.with_ymd_and_hms(2025, 10, 15, 10, 0, 0).unwrap();
//! let quote = calculate_quote(&QuoteRequest::new("same-day", 25.0, 8.0), &at);
//!
//! assert_eq!(quote.total_amount, 152.0);
//! ```

use crate::config::*;
use crate::errors::CourierError;
use crate::models::ServiceType;
use crate::utils::format_currency;
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use log::warn;
use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Параметры расчёта.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRequest {
    /// Тип услуги как его передал пользователь или интерфейс.
    pub service_type: String,
    /// Расстояние, км.
    pub distance_km: f64,
    /// Вес, кг.
    pub weight_kg: f64,
    /// Сумма покупки. Учитывается только для [`ServiceType::SwiftErrand`].
    pub purchase_amount: f64,
    /// Нужен прицеп. Учитывается только для [`ServiceType::FurnitureMoving`].
    pub include_trailer: bool,
}

impl QuoteRequest {
    /// Создать запрос со значениями по умолчанию: без покупки и без прицепа.
    pub fn new(service_type: impl Into<String>, distance_km: f64, weight_kg: f64) -> Self {
        Self {
            service_type: service_type.into(),
            distance_km,
            weight_kg,
            purchase_amount: 0.0,
            include_trailer: false,
        }
    }

    /// Создать запрос для известного типа услуги.
    pub fn for_service(service: ServiceType, distance_km: f64, weight_kg: f64) -> Self {
        Self::new(service.to_string(), distance_km, weight_kg)
    }

    /// Указать сумму покупки (для поручений).
    pub fn purchase_amount(mut self, amount: f64) -> Self {
        self.purchase_amount = amount;
        self
    }

    /// Запросить прицеп (для перевозки мебели).
    pub fn with_trailer(mut self, include_trailer: bool) -> Self {
        self.include_trailer = include_trailer;
        self
    }
}

/// Тарифная схема, по которой ведётся расчёт.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeSchedule {
    /// Тариф конкретной услуги.
    Service(ServiceType),
    /// Тариф по умолчанию для нераспознанного типа услуги.
    Fallback,
}

impl FeeSchedule {
    /// Подобрать тариф по строковому типу услуги.
    ///
    /// Нераспознанный тип не является ошибкой для вызывающего: выводится
    /// предупреждение в лог и используется тариф по умолчанию.
    pub fn resolve(raw: &str) -> Self {
        match Self::try_resolve(raw) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!("{}: расчёт по тарифу по умолчанию", err);
                FeeSchedule::Fallback
            }
        }
    }

    /// Строгий вариант [`FeeSchedule::resolve`].
    pub fn try_resolve(raw: &str) -> Result<Self, CourierError> {
        raw.parse::<ServiceType>()
            .map(FeeSchedule::Service)
            .map_err(|_| CourierError::InvalidServiceType(raw.to_string()))
    }

    /// Тип услуги, если тариф распознан.
    pub fn service_type(&self) -> Option<ServiceType> {
        match self {
            FeeSchedule::Service(service) => Some(*service),
            FeeSchedule::Fallback => None,
        }
    }

    /// Услуга не подлежит пиковой наценке.
    pub fn is_surge_exempt(&self) -> bool {
        matches!(self, FeeSchedule::Service(ServiceType::Standard))
    }
}

/// Расчёт стоимости с детализацией.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Тип услуги; `None`, если применён тариф по умолчанию.
    pub service_type: Option<ServiceType>,
    pub distance_km: f64,
    pub weight_kg: f64,
    pub purchase_amount: f64,
    pub include_trailer: bool,
    /// Действует пиковая наценка.
    pub is_peak_hour: bool,
    pub base_fee: f64,
    pub distance_fee: f64,
    pub weight_fee: f64,
    pub service_fee: f64,
    pub trailer_fee: f64,
    pub surge_multiplier: f64,
    /// Сумма пиковой наценки: `subtotal * (surge_multiplier - 1)`.
    pub surge_amount: f64,
    pub total_amount: f64,
}

impl Quote {
    /// Сумма до пикового множителя и прицепа.
    pub fn subtotal(&self) -> f64 {
        self.base_fee + self.distance_fee + self.weight_fee + self.service_fee
    }
}

impl Display for Quote {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let service = self
            .service_type
            .map(|s| s.to_string())
            .unwrap_or_else(|| "DEFAULT".to_string());

        writeln!(f, "Type:      {}", service)?;
        writeln!(f, "Base:      {}", format_currency(self.base_fee))?;
        writeln!(f, "Distance:  {}", format_currency(self.distance_fee))?;
        writeln!(f, "Weight:    {}", format_currency(self.weight_fee))?;
        writeln!(f, "Service:   {}", format_currency(self.service_fee))?;
        if self.trailer_fee > 0.0 {
            writeln!(f, "Trailer:   {}", format_currency(self.trailer_fee))?;
        }
        if self.is_peak_hour {
            writeln!(
                f,
                "Surge:     {} (x{})",
                format_currency(self.surge_amount),
                self.surge_multiplier
            )?;
        }
        write!(f, "Total:     {}", format_currency(self.total_amount))
    }
}

/// Информация о действующей наценке для баннера интерфейса.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurgeInfo {
    pub is_peak: bool,
    pub message: String,
}

/// Проверить, попадает ли момент в часы пик.
///
/// Часы пик: понедельник–пятница, `[7, 9)` и `[17, 19)` по местному времени
/// переданной даты.
pub fn is_peak_hour<Tz: TimeZone>(at: &DateTime<Tz>) -> bool {
    let is_weekday = at.weekday().number_from_monday() <= 5;
    let hour = at.hour();
    let in_window = |(start, end): (u32, u32)| hour >= start && hour < end;

    is_weekday && (in_window(MORNING_PEAK_HOURS) || in_window(EVENING_PEAK_HOURS))
}

/// Сообщение о действующей наценке на указанный момент.
pub fn surge_info<Tz: TimeZone>(at: &DateTime<Tz>) -> SurgeInfo {
    let is_peak = is_peak_hour(at);
    let message = if is_peak {
        format!(
            "Peak hours pricing is active ({:.0}% surcharge)",
            (PEAK_MULTIPLIER - 1.0) * 100.0
        )
    } else {
        "Normal pricing is active".to_string()
    };

    SurgeInfo { is_peak, message }
}

/// Рассчитать стоимость на текущий момент по местному времени.
pub fn estimate_now(request: &QuoteRequest) -> Quote {
    calculate_quote(request, &Local::now())
}

/// Рассчитать стоимость на указанный момент.
///
/// Отрицательные и нечисловые входные значения считаются нулём, поэтому
/// итог всегда неотрицателен.
pub fn calculate_quote<Tz: TimeZone>(request: &QuoteRequest, at: &DateTime<Tz>) -> Quote {
    let schedule = FeeSchedule::resolve(&request.service_type);

    let distance = non_negative(request.distance_km);
    let weight = non_negative(request.weight_kg);
    let purchase = non_negative(request.purchase_amount);

    let over_distance = (distance - FREE_DISTANCE_KM).max(0.0);
    let over_weight = (weight - FREE_WEIGHT_KG).max(0.0);

    let (base_fee, distance_fee, weight_fee, service_fee) = match schedule.service_type() {
        Some(ServiceType::Standard) => (STANDARD_BASE_FEE, 0.0, over_weight * RATE_PER_KG, 0.0),
        Some(ServiceType::SameDay) => (
            BASE_FEE,
            over_distance * RATE_PER_KM,
            over_weight * RATE_PER_KG,
            0.0,
        ),
        Some(ServiceType::SwiftErrand) => (
            BASE_FEE,
            over_distance * RATE_PER_KM,
            over_weight * RATE_PER_KG,
            errand_service_fee(purchase),
        ),
        Some(ServiceType::Instant) => (
            BASE_FEE,
            over_distance * INSTANT_RATE_PER_KM,
            weight * RATE_PER_KG,
            0.0,
        ),
        Some(ServiceType::FurnitureMoving) | None => (
            BASE_FEE,
            distance * RATE_PER_KM,
            over_weight * RATE_PER_KG,
            0.0,
        ),
    };

    let peak = is_peak_hour(at) && !schedule.is_surge_exempt();
    let surge_multiplier = if peak { PEAK_MULTIPLIER } else { 1.0 };

    let trailer_fee = match schedule.service_type() {
        Some(ServiceType::FurnitureMoving) if request.include_trailer => TRAILER_FEE,
        _ => 0.0,
    };

    let subtotal = base_fee + distance_fee + weight_fee + service_fee;
    let surge_amount = subtotal * (surge_multiplier - 1.0);
    let total_amount = subtotal * surge_multiplier + trailer_fee;

    Quote {
        service_type: schedule.service_type(),
        distance_km: distance,
        weight_kg: weight,
        purchase_amount: purchase,
        include_trailer: trailer_fee > 0.0,
        is_peak_hour: peak,
        base_fee,
        distance_fee,
        weight_fee,
        service_fee,
        trailer_fee,
        surge_multiplier,
        surge_amount,
        total_amount,
    }
}

/// Сервисный сбор за поручение.
fn errand_service_fee(purchase_amount: f64) -> f64 {
    if purchase_amount >= ERRAND_PERCENT_THRESHOLD {
        (purchase_amount * ERRAND_SERVICE_SHARE).max(ERRAND_MIN_SERVICE_FEE)
    } else {
        ERRAND_MIN_SERVICE_FEE
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
