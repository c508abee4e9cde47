//! Собственные типы ошибок приложения.
//!
//! Для поддержки функциональности применяется крейт `thiserror`.

use std::sync::PoisonError;
use thiserror::Error;

/// Дерево ошибок приложений Courier.
#[derive(Error, Debug)]
pub enum CourierError {
    /// Некорректное значение.
    ///
    /// Например, если ожидается неотрицательный вес, а передано `-3`.
    #[error("неверное значение: {0}")]
    ValueError(String),

    /// Неизвестный тип услуги доставки.
    ///
    /// Тарифный калькулятор не пробрасывает эту ошибку наружу: он логирует
    /// предупреждение и считает по тарифу по умолчанию.
    #[error("неизвестный тип услуги: {0}")]
    InvalidServiceType(String),

    /// Неизвестный статус заказа.
    #[error("неизвестный статус заказа: {0}")]
    InvalidStatus(String),

    /// Попытка перевести заказ в более ранний статус.
    #[error("заказ {tracking_number}: переход {from} -> {to} недопустим")]
    StatusRegression {
        tracking_number: String,
        from: String,
        to: String,
    },

    /// Ошибка блокировки mutex.
    #[error("ошибка блокировки: {0}")]
    LockError(String),

    /// Некорректный STOMP-фрейм.
    #[error("ошибка STOMP-фрейма: {0}")]
    Frame(String),

    /// Ошибка транспортного уровня (WebSocket).
    #[error("ошибка транспорта: {0}")]
    Transport(String),

    /// Сервер отклонил STOMP-рукопожатие или не ответил вовремя.
    #[error("ошибка рукопожатия: {0}")]
    Handshake(String),

    /// Входящее сообщение не удалось разобрать.
    #[error("некорректное сообщение: {0}")]
    MalformedMessage(String),

    /// Ошибка, полученная от backend: HTTP-статус и текст ошибки.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    /// Сетевая ошибка при обращении к backend.
    #[error("сетевая ошибка: {0}")]
    Network(String),

    /// Ошибка ввода-вывода.
    #[error("ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибка (де)сериализации JSON.
    #[error("ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl<T> From<PoisonError<T>> for CourierError {
    fn from(err: PoisonError<T>) -> Self {
        CourierError::LockError(err.to_string())
    }
}

impl CourierError {
    /// Конструктор для ошибки [`CourierError::ValueError`].
    pub fn value_err(message: impl Into<String>) -> CourierError {
        Self::ValueError(message.into())
    }

    /// Конструктор для ошибки [`CourierError::Frame`].
    pub fn frame_err(message: impl Into<String>) -> CourierError {
        Self::Frame(message.into())
    }

    /// Конструктор для ошибки [`CourierError::Transport`].
    pub fn transport_err(message: impl Into<String>) -> CourierError {
        Self::Transport(message.into())
    }

    /// Конструктор для ошибки [`CourierError::Handshake`].
    pub fn handshake_err(message: impl Into<String>) -> CourierError {
        Self::Handshake(message.into())
    }

    /// Конструктор для ошибки [`CourierError::MalformedMessage`].
    pub fn malformed_err(message: impl Into<String>) -> CourierError {
        Self::MalformedMessage(message.into())
    }

    /// Конструктор для ошибки [`CourierError::Api`].
    pub fn api_err(status: u16, message: impl Into<String>) -> CourierError {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Ошибка транспорта восстанавливается переподключением и не должна
    /// доходить до пользователя.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CourierError::Transport(_) | CourierError::Handshake(_) | CourierError::Frame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn api_error_keeps_backend_message() {
        let err = CourierError::api_err(403, "Access denied");
        assert_eq!(err.to_string(), "Access denied (HTTP 403)");
    }

    #[test]
    fn poisoned_mutex_becomes_lock_error() {
        let m = Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _g = m.lock().unwrap();
            panic!("poison");
        });

        let err: CourierError = m.lock().unwrap_err().into();
        assert!(matches!(err, CourierError::LockError(_)));
    }

    #[test]
    fn transport_errors_are_recoverable() {
        assert!(CourierError::transport_err("closed").is_recoverable());
        assert!(!CourierError::api_err(500, "boom").is_recoverable());
    }
}
