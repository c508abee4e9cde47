//! Courier Client: REST-клиент backend, STOMP-сессия поверх WebSocket и
//! живое отслеживание заказов.

pub mod api;
pub mod config;
pub mod session;
pub mod stomp;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod testing;
