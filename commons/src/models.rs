//! Модели данных для приложений.

use crate::errors::CourierError;
use macros::EnumDisplay;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Тип услуги доставки.
///
/// Принимается как в написании backend (`SAME_DAY`), так и в написании
/// веб-интерфейса (`same-day`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay)]
pub enum ServiceType {
    /// Стандартная доставка: фиксированная цена, без пиковой наценки.
    #[str("STANDARD")]
    Standard,
    /// Доставка в тот же день.
    #[str("SAME_DAY", "same-day", "same_day", "sameday")]
    SameDay,
    /// Поручение: курьер выкупает товар и доставляет его.
    #[str("SWIFT_ERRAND", "swift-errand", "swift_errand", "errand")]
    SwiftErrand,
    /// Срочная доставка.
    #[str("INSTANT")]
    Instant,
    /// Перевозка мебели (опционально с прицепом).
    #[str("FURNITURE_MOVING", "furniture-moving", "furniture_moving", "furniture")]
    FurnitureMoving,
}

/// Статус заказа.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay)]
pub enum OrderStatus {
    /// Ожидает забора у отправителя.
    #[str("AWAITING_COLLECTION")]
    AwaitingCollection,
    /// Оплачен.
    #[str("PAID")]
    Paid,
    /// Забран курьером.
    #[str("COLLECTED")]
    Collected,
    /// В пути.
    #[str("IN_TRANSIT")]
    InTransit,
    /// Доставлен.
    #[str("DELIVERED")]
    Delivered,
    /// Отменён.
    #[str("CANCELLED", "CANCELED")]
    Cancelled,
}

impl OrderStatus {
    /// Терминальный статус: дальнейших обновлений не ожидается.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Позиция статуса на прямом пути заказа.
    ///
    /// `AwaitingCollection` и `Paid` делят первую ступень. `Cancelled` вне
    /// линейного порядка и не имеет позиции.
    fn rank(&self) -> Option<u8> {
        match self {
            OrderStatus::AwaitingCollection | OrderStatus::Paid => Some(0),
            OrderStatus::Collected => Some(1),
            OrderStatus::InTransit => Some(2),
            OrderStatus::Delivered => Some(3),
            OrderStatus::Cancelled => None,
        }
    }

    /// Проверить, допустим ли переход `self -> next`.
    ///
    /// Статус двигается только вперёд, переход внутри первой ступени
    /// (`AwaitingCollection` <-> `Paid`) допустим в обе стороны. `Cancelled`
    /// достижим из любого нетерминального статуса. Из терминальных статусов
    /// переходов нет.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next >= current,
            (None, Some(_)) => false,
        }
    }

    /// Подпись статуса для пользователя.
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::AwaitingCollection => "Awaiting Collection",
            OrderStatus::Paid => "Paid",
            OrderStatus::Collected => "Collected",
            OrderStatus::InTransit => "In Transit",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

/// Сериализация перечислений через их строковое представление
/// (`Display`/`FromStr`), чтобы синонимы работали и в JSON.
macro_rules! serde_via_str {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                <$ty>::from_str(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

serde_via_str!(ServiceType);
serde_via_str!(OrderStatus);

/// Текущее местоположение заказа.
///
/// Backend присылает либо адрес строкой, либо пару координат.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Location {
    /// Координаты в виде объекта `{"lat": .., "lng": ..}`.
    Point { lat: f64, lng: f64 },
    /// Координаты в виде массива `[lat, lng]`.
    Pair([f64; 2]),
    /// Адрес или произвольное описание.
    Address(String),
}

impl Location {
    /// Координаты точки, если местоположение задано координатами.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self {
            Location::Point { lat, lng } => Some((*lat, *lng)),
            Location::Pair([lat, lng]) => Some((*lat, *lng)),
            Location::Address(_) => None,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Address(address) => write!(f, "{}", address),
            _ => {
                let (lat, lng) = self.coordinates().unwrap_or_default();
                write!(f, "{:.5}, {:.5}", lat, lng)
            }
        }
    }
}

/// Обновление заказа, присылаемое в топик `/topic/order/{trackingNumber}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    /// Новый статус заказа.
    pub status: OrderStatus,
    /// Текущее местоположение, если известно.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
}

impl FromStr for OrderUpdate {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|err| CourierError::malformed_err(err.to_string()))
    }
}

/// Результат применения обновления к [`TrackedOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Статус продвинулся вперёд.
    Advanced,
    /// Статус прежний, обновлено местоположение.
    Relocated,
    /// Ничего не изменилось.
    Unchanged,
}

/// Клиентская проекция состояния заказа.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedOrder {
    /// Трек-номер заказа (назначается backend).
    pub tracking_number: String,
    /// Текущий статус.
    pub status: OrderStatus,
    /// Текущее местоположение.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
}

impl TrackedOrder {
    /// Создать проекцию заказа.
    pub fn new(tracking_number: impl Into<String>, status: OrderStatus) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            status,
            current_location: None,
        }
    }

    /// Применить входящее обновление.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::StatusRegression`], если обновление пытается вернуть
    /// статус назад или изменить терминальный статус. Состояние заказа при
    /// этом не меняется.
    pub fn apply(&mut self, update: &OrderUpdate) -> Result<UpdateOutcome, CourierError> {
        if update.status == self.status {
            if self.status.is_terminal() {
                return Ok(UpdateOutcome::Unchanged);
            }
            return match &update.current_location {
                Some(location) if self.current_location.as_ref() != Some(location) => {
                    self.current_location = Some(location.clone());
                    Ok(UpdateOutcome::Relocated)
                }
                _ => Ok(UpdateOutcome::Unchanged),
            };
        }

        if !self.status.can_advance_to(update.status) {
            return Err(CourierError::StatusRegression {
                tracking_number: self.tracking_number.clone(),
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }

        self.status = update.status;
        if update.current_location.is_some() {
            self.current_location = update.current_location.clone();
        }
        Ok(UpdateOutcome::Advanced)
    }

    /// Заказ в терминальном статусе.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Display for TrackedOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} | {}", self.tracking_number, self.status.label())?;
        if let Some(location) = &self.current_location {
            write!(f, " | {}", location)?;
        }
        Ok(())
    }
}

/// Запись истории заказов клиента.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: i64,
    pub tracking_number: String,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub price: f64,
    /// Статус как есть: в истории встречаются значения, неизвестные
    /// клиенту. Разбирается по запросу через [`OrderRecord::order_status`].
    pub status: String,
    #[serde(default)]
    pub pickup_address: String,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub recipient_name: String,
    #[serde(default)]
    pub recipient_phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_time: Option<String>,
    /// Тип услуги как есть: backend может прислать значение, неизвестное
    /// клиенту.
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
}

impl OrderRecord {
    /// Статус записи, если он известен клиенту.
    pub fn order_status(&self) -> Option<OrderStatus> {
        self.status.parse().ok()
    }

    /// Подпись статуса для пользователя; неизвестный статус выводится как есть.
    pub fn status_label(&self) -> &str {
        match self.order_status() {
            Some(status) => status.label(),
            None => self.status.as_str(),
        }
    }

    /// Проекция записи для отслеживания.
    ///
    /// `None` для записи с неизвестным статусом.
    pub fn to_tracked(&self) -> Option<TrackedOrder> {
        self.order_status()
            .map(|status| TrackedOrder::new(self.tracking_number.clone(), status))
    }
}

/// Сводка по заказам для панели клиента.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    /// Ожидают забора (включая оплаченные).
    pub awaiting_collection: usize,
    pub collected: usize,
    pub in_transit: usize,
    pub delivered: usize,
    pub cancelled: usize,
    /// Записи со статусом, неизвестным клиенту.
    pub other: usize,
}

impl OrderStats {
    /// Посчитать сводку по списку статусов.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = OrderStatus>,
    {
        let mut stats = Self::default();
        for status in statuses {
            match status {
                OrderStatus::AwaitingCollection | OrderStatus::Paid => {
                    stats.awaiting_collection += 1
                }
                OrderStatus::Collected => stats.collected += 1,
                OrderStatus::InTransit => stats.in_transit += 1,
                OrderStatus::Delivered => stats.delivered += 1,
                OrderStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Посчитать сводку по истории заказов.
    pub fn from_records(records: &[OrderRecord]) -> Self {
        let known = records.iter().filter_map(OrderRecord::order_status);
        let mut stats = Self::from_statuses(known);
        stats.other = records.iter().filter(|r| r.order_status().is_none()).count();
        stats
    }
}

impl Display for OrderStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "awaiting: {} | collected: {} | in transit: {} | delivered: {} | cancelled: {}",
            self.awaiting_collection, self.collected, self.in_transit, self.delivered, self.cancelled
        )?;
        if self.other > 0 {
            write!(f, " | other: {}", self.other)?;
        }
        Ok(())
    }
}
