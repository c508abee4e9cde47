//! Тарифная сетка и параметры расчёта стоимости.
//!
//! Значения повторяют тарифы backend и используются для мгновенной локальной
//! оценки. Окончательную цену всё равно назначает backend.

/// Базовая цена стандартной доставки.
pub const STANDARD_BASE_FEE: f64 = 100.0;

/// Базовая цена для остальных услуг.
pub const BASE_FEE: f64 = 80.0;

/// Расстояние (км), включённое в базовую цену.
pub const FREE_DISTANCE_KM: f64 = 10.0;

/// Вес (кг), включённый в базовую цену.
pub const FREE_WEIGHT_KG: f64 = 5.0;

/// Цена за километр сверх включённого расстояния.
pub const RATE_PER_KM: f64 = 4.0;

/// Цена за километр для срочной доставки.
pub const INSTANT_RATE_PER_KM: f64 = 5.5;

/// Цена за килограмм.
pub const RATE_PER_KG: f64 = 4.0;

/// Минимальный сервисный сбор за поручение.
pub const ERRAND_MIN_SERVICE_FEE: f64 = 150.0;

/// Сумма покупки, начиная с которой сбор считается в процентах.
pub const ERRAND_PERCENT_THRESHOLD: f64 = 1500.0;

/// Доля сервисного сбора от суммы покупки.
pub const ERRAND_SERVICE_SHARE: f64 = 0.1;

/// Надбавка за прицеп при перевозке мебели. Пиковая наценка не применяется.
pub const TRAILER_FEE: f64 = 450.0;

/// Множитель в часы пик.
pub const PEAK_MULTIPLIER: f64 = 1.2;

/// Утренний час пик `[start, end)`.
pub const MORNING_PEAK_HOURS: (u32, u32) = (7, 9);

/// Вечерний час пик `[start, end)`.
pub const EVENING_PEAK_HOURS: (u32, u32) = (17, 19);

/// Символ валюты для вывода сумм.
pub const CURRENCY_SYMBOL: &str = "R";
