//! Универсальные трейты для приложений Courier.

use crate::errors::CourierError;
use crate::models::{OrderRecord, TrackedOrder};

/// Источник актуального состояния заказов (REST backend).
///
/// Трекер получает через него начальный снимок заказа перед подпиской
/// на обновления. В тестах подменяется заглушкой.
pub trait OrderSource: Send + Sync {
    /// Получить текущее состояние заказа по трек-номеру.
    fn fetch_order(&self, tracking_number: &str) -> Result<TrackedOrder, CourierError>;

    /// Получить историю заказов клиента.
    fn order_history(&self) -> Result<Vec<OrderRecord>, CourierError>;
}

impl<T: OrderSource + ?Sized> OrderSource for std::sync::Arc<T> {
    fn fetch_order(&self, tracking_number: &str) -> Result<TrackedOrder, CourierError> {
        (**self).fetch_order(tracking_number)
    }

    fn order_history(&self) -> Result<Vec<OrderRecord>, CourierError> {
        (**self).order_history()
    }
}
