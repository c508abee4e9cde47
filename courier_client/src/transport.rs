//! Транспорт STOMP-сессии: WebSocket на базе `tungstenite`.
//!
//! Сессия работает с транспортом через трейты [`Connector`] и
//! [`Transport`], поэтому в тестах сокет подменяется каналами в памяти.

use commons::errors::CourierError;
use log::{debug, info};
use std::io;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

/// Двунаправленный канал текстовых сообщений.
pub trait Transport: Send {
    /// Отправить текстовое сообщение.
    fn send_text(&mut self, text: &str) -> Result<(), CourierError>;

    /// Дождаться сообщения не дольше `timeout`.
    ///
    /// ## Returns
    ///
    /// `Ok(None)`, если за отведённое время ничего не пришло. Пустая строка
    /// означает активность без данных (например, ping).
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::Transport`], если соединение закрыто или сломано.
    fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, CourierError>;

    /// Закрыть соединение (без ошибок, по возможности).
    fn close(&mut self);
}

/// Фабрика транспортных соединений.
pub trait Connector: Send + Sync + 'static {
    /// Открыть новое соединение по адресу.
    fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, CourierError>;
}

/// Подключение к STOMP-брокеру по WebSocket (`ws://` и `wss://`).
///
/// TCP-подключение и рукопожатие WebSocket ограничены `timeout`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    timeout: Duration,
}

impl WsConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.max(Duration::from_millis(1)),
        }
    }

    /// Открыть TCP-соединение с первым отвечающим адресом хоста.
    fn open_tcp(&self, url: &Url) -> Result<TcpStream, CourierError> {
        let addrs = url
            .socket_addrs(|| None)
            .map_err(|err| CourierError::transport_err(format!("{}: {}", url, err)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout))?;
                    stream.set_write_timeout(Some(self.timeout))?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!("Подключение к {} не удалось: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }

        Err(CourierError::transport_err(match last_err {
            Some(err) => format!("{}: {}", url, err),
            None => format!("{}: адрес не найден", url),
        }))
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, CourierError> {
        let stream = self.open_tcp(url)?;
        let (socket, response) = tungstenite::client_tls_with_config(url.as_str(), stream, None, None)
            .map_err(|err| CourierError::transport_err(format!("{}: {}", url, err)))?;

        info!("WebSocket открыт: {} (HTTP {})", url, response.status());

        Ok(Box::new(WsTransport {
            socket,
            read_timeout: None,
        }))
    }
}

/// Открытый WebSocket.
pub struct WsTransport {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
    read_timeout: Option<Duration>,
}

impl WsTransport {
    /// Выставить таймаут чтения на нижележащем TCP-сокете.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout == Some(timeout) {
            return Ok(());
        }

        match self.socket.get_mut() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(timeout))?,
            MaybeTlsStream::Rustls(stream) => stream.sock.set_read_timeout(Some(timeout))?,
            _ => {}
        }
        self.read_timeout = Some(timeout);
        Ok(())
    }
}

impl Transport for WsTransport {
    fn send_text(&mut self, text: &str) -> Result<(), CourierError> {
        self.socket
            .send(Message::Text(text.to_string()))
            .map_err(|err| CourierError::transport_err(err.to_string()))
    }

    fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, CourierError> {
        self.set_read_timeout(timeout)?;

        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CourierError::transport_err("двоичное сообщение не в UTF-8")),
            Ok(Message::Close(frame)) => Err(CourierError::transport_err(format!(
                "сервер закрыл соединение: {:?}",
                frame
            ))),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                Ok(Some(String::new()))
            }
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(CourierError::transport_err(err.to_string())),
        }
    }

    fn close(&mut self) {
        if let Err(err) = self.socket.close(None) {
            debug!("Закрытие WebSocket: {}", err);
        }
        let _ = self.socket.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn refused_connection_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/ws")).unwrap();

        let result = WsConnector::new(Duration::from_secs(1)).connect(&url);
        assert!(matches!(result, Err(CourierError::Transport(_))));
    }

    #[test]
    fn silent_server_fails_within_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("ws://{}/ws", listener.local_addr().unwrap())).unwrap();
        let connector = WsConnector::new(Duration::from_millis(200));

        let started = Instant::now();
        let result = connector.connect(&url);

        assert!(matches!(result, Err(CourierError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }
}
