//! Кодек протокола STOMP 1.2 поверх текстовых сообщений WebSocket.
//!
//! Фрейм: строка команды, заголовки `ключ:значение`, пустая строка, тело
//! и завершающий `NUL`. Одно сообщение WebSocket может содержать несколько
//! фреймов, а пустые строки между ними являются heart-beat.

use commons::errors::CourierError;
use macros::EnumDisplay;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Версия протокола, которую запрашивает клиент.
pub const ACCEPT_VERSION: &str = "1.2";

/// Heart-beat: одиночный перевод строки.
pub const HEARTBEAT_FRAME: &str = "\n";

/// Команды STOMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay)]
pub enum Command {
    #[str("CONNECT")]
    Connect,
    #[str("STOMP")]
    Stomp,
    #[str("CONNECTED")]
    Connected,
    #[str("SUBSCRIBE")]
    Subscribe,
    #[str("UNSUBSCRIBE")]
    Unsubscribe,
    #[str("SEND")]
    Send,
    #[str("ACK")]
    Ack,
    #[str("NACK")]
    Nack,
    #[str("DISCONNECT")]
    Disconnect,
    #[str("MESSAGE")]
    Message,
    #[str("RECEIPT")]
    Receipt,
    #[str("ERROR")]
    Error,
}

impl Command {
    /// Фреймы рукопожатия передают заголовки без экранирования.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

/// Фрейм STOMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Заголовки в порядке следования. При повторах значимо первое значение.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Пустой фрейм с командой.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Добавить заголовок.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Задать тело фрейма.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Значение заголовка.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Фрейм `CONNECT` с авторизацией и желаемым heart-beat.
    pub fn connect(host: &str, token: Option<&str>, heartbeat: HeartBeat) -> Self {
        let frame = Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", heartbeat.to_string());

        match token {
            Some(token) => frame.header("Authorization", format!("Bearer {}", token)),
            None => frame,
        }
    }

    /// Фрейм `SUBSCRIBE`. Идентификатор подписки совпадает с топиком.
    pub fn subscribe(topic: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", topic)
            .header("destination", topic)
            .header("ack", "auto")
    }

    /// Фрейм `UNSUBSCRIBE`.
    pub fn unsubscribe(topic: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", topic)
    }

    /// Фрейм `DISCONNECT`.
    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    /// Топик, к которому относится `MESSAGE`: сначала `subscription`,
    /// затем `destination`.
    pub fn topic(&self) -> Option<&str> {
        self.get("subscription").or_else(|| self.get("destination"))
    }

    /// Закодировать фрейм в текст для отправки.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());

        out.push_str(&self.command.to_string());
        out.push('\n');
        for (key, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(key));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(key);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Разобрать все фреймы сообщения WebSocket.
    ///
    /// Heart-beat (пустые строки) пропускаются. Сообщение из одних heart-beat
    /// даёт пустой вектор.
    ///
    /// ## Ошибки
    ///
    /// [`CourierError::Frame`], если хотя бы один фрейм некорректен.
    pub fn decode_all(text: &str) -> Result<Vec<Frame>, CourierError> {
        let mut frames = Vec::new();
        let mut rest = text;

        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }
            let (frame, consumed) = Self::decode_one(rest)?;
            frames.push(frame);
            rest = &rest[consumed..];
        }

        Ok(frames)
    }

    /// Разобрать один фрейм в начале `input`, вернуть его и число
    /// прочитанных байт.
    fn decode_one(input: &str) -> Result<(Frame, usize), CourierError> {
        let mut pos = 0;
        let mut lines = Vec::new();
        loop {
            let Some(nl) = input[pos..].find('\n') else {
                return Err(CourierError::frame_err("нет конца заголовков"));
            };
            let line = input[pos..pos + nl].trim_end_matches('\r');
            pos += nl + 1;
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let mut lines = lines.into_iter();
        let raw_command = lines
            .next()
            .ok_or_else(|| CourierError::frame_err("отсутствует команда"))?;
        let command = Command::from_str(raw_command)
            .map_err(|_| CourierError::frame_err(format!("неизвестная команда '{raw_command}'")))?;

        let unescape = command.escapes_headers();
        let mut headers = Vec::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| CourierError::frame_err(format!("заголовок без ':' '{line}'")))?;
            if unescape {
                headers.push((unescape_header(key)?, unescape_header(value)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: String::new(),
        };

        let body_end = match frame.get("content-length") {
            Some(raw) => {
                let len: usize = raw.trim().parse().map_err(|_| {
                    CourierError::frame_err(format!("некорректный content-length '{raw}'"))
                })?;
                let end = pos + len;
                if input.as_bytes().get(end) != Some(&0) {
                    return Err(CourierError::frame_err("тело не совпадает с content-length"));
                }
                end
            }
            None => input[pos..]
                .find('\0')
                .map(|i| pos + i)
                .ok_or_else(|| CourierError::frame_err("фрейм не завершён NUL"))?,
        };

        frame.body = input
            .get(pos..body_end)
            .ok_or_else(|| CourierError::frame_err("тело разрезает символ UTF-8"))?
            .to_string();

        Ok((frame, body_end + 1))
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        if let Some(topic) = self.topic() {
            write!(f, " {}", topic)?;
        }
        if let Some(message) = self.get("message") {
            write!(f, " ({})", message)?;
        }
        Ok(())
    }
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, CourierError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(CourierError::frame_err(format!(
                    "недопустимая escape-последовательность '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Параметры heart-beat: `cx,cy` в терминах STOMP.
///
/// Нулевой интервал означает, что направление отключено.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// Как часто эта сторона отправляет heart-beat.
    pub outgoing: Duration,
    /// Как часто эта сторона хочет получать heart-beat.
    pub incoming: Duration,
}

impl HeartBeat {
    /// Одинаковый интервал в обе стороны.
    pub fn symmetric(interval: Duration) -> Self {
        Self {
            outgoing: interval,
            incoming: interval,
        }
    }

    /// Итоговые интервалы клиента с учётом предложения сервера.
    ///
    /// Направление включено, только если обе стороны его поддерживают;
    /// интервал равен большему из двух.
    pub fn negotiate(&self, server: &HeartBeat) -> HeartBeat {
        let pick = |ours: Duration, theirs: Duration| {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        };

        HeartBeat {
            outgoing: pick(self.outgoing, server.incoming),
            incoming: pick(self.incoming, server.outgoing),
        }
    }
}

impl Display for HeartBeat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }
}

impl FromStr for HeartBeat {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cx, cy) = s
            .split_once(',')
            .ok_or_else(|| CourierError::frame_err(format!("некорректный heart-beat '{s}'")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| CourierError::frame_err(format!("некорректный heart-beat '{s}'")))
        };

        Ok(Self {
            outgoing: parse(cx)?,
            incoming: parse(cy)?,
        })
    }
}
