//! Responses the proxy writes to clients on its own behalf
use std::time::Duration;

use crate::parser::HttpMessage;

pub const CONNECTION_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nConnection: close\r\n\r\n";

const ERROR_BODY: &str = "Error occurred while connecting to the remote host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultAnswer {
    /// 200 after a successful CONNECT
    ConnectionEstablished,
    /// 400, the connection is closed after it
    BadRequest,
    /// 503, the upstream sent something unparsable
    InvalidResponse,
    /// 503, the upstream could not be reached or went away
    ConnectionFailed { message: Option<String> },
    /// 504, the upstream did not answer in time
    GatewayTimeout,
}

impl From<&DefaultAnswer> for u16 {
    fn from(answer: &DefaultAnswer) -> u16 {
        match answer {
            DefaultAnswer::ConnectionEstablished => 200,
            DefaultAnswer::BadRequest => 400,
            DefaultAnswer::InvalidResponse => 503,
            DefaultAnswer::ConnectionFailed { .. } => 503,
            DefaultAnswer::GatewayTimeout => 504,
        }
    }
}

impl DefaultAnswer {
    pub fn status(&self) -> &'static str {
        match self {
            DefaultAnswer::ConnectionEstablished => "Connection established",
            DefaultAnswer::BadRequest => "Bad request",
            DefaultAnswer::InvalidResponse => "Invalid response",
            DefaultAnswer::ConnectionFailed { .. } => "Connection failed",
            DefaultAnswer::GatewayTimeout => "Gateway timeout",
        }
    }

    /// the client connection cannot be used after this answer
    pub fn closes_connection(&self) -> bool {
        matches!(self, DefaultAnswer::BadRequest)
    }

    /// Serialized answer. Error answers advertise `keep_alive` as the idle
    /// window of the client connection.
    pub fn render(&self, keep_alive: Duration) -> Vec<u8> {
        let body = match self {
            DefaultAnswer::ConnectionEstablished => return CONNECTION_ESTABLISHED.to_vec(),
            DefaultAnswer::BadRequest => {
                let mut message = HttpMessage::response(u16::from(self), self.status());
                message.add_header("Content-Length", "0");
                message.add_header("Connection", "close");
                return message.to_bytes();
            }
            DefaultAnswer::ConnectionFailed {
                message: Some(cause),
            } => format!("{}: {}\n", ERROR_BODY, cause),
            DefaultAnswer::ConnectionFailed { message: None }
            | DefaultAnswer::InvalidResponse
            | DefaultAnswer::GatewayTimeout => format!("{}\n", ERROR_BODY),
        };

        let mut message = HttpMessage::response(u16::from(self), self.status());
        message.add_header("Content-Type", "text/plain");
        message.add_header("Content-Length", &body.len().to_string());
        message.add_header("Keep-Alive", &format!("timeout={}", keep_alive.as_secs()));

        let mut answer = message.to_bytes();
        answer.extend_from_slice(body.as_bytes());
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEEP_ALIVE: Duration = Duration::from_secs(30);

    #[test]
    fn connect_reply_is_fixed() {
        let answer = DefaultAnswer::ConnectionEstablished;
        assert_eq!(u16::from(&answer), 200);
        assert_eq!(
            answer.render(KEEP_ALIVE),
            b"HTTP/1.1 200 Connection established\r\nConnection: close\r\n\r\n".to_vec()
        );
        // the tunnel goes on over the same connection
        assert!(!answer.closes_connection());
    }

    #[test]
    fn bad_request() {
        let answer = DefaultAnswer::BadRequest;
        assert_eq!(u16::from(&answer), 400);
        assert!(answer.closes_connection());
        assert_eq!(
            String::from_utf8(answer.render(KEEP_ALIVE)).unwrap(),
            "HTTP/1.1 400 Bad request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn error_answers_carry_a_plain_text_body() {
        let answer = DefaultAnswer::ConnectionFailed {
            message: Some("Connection refused (os error 111)".to_owned()),
        };
        let body = "Error occurred while connecting to the remote host: Connection refused (os error 111)\n";
        assert_eq!(
            String::from_utf8(answer.render(KEEP_ALIVE)).unwrap(),
            format!(
                "HTTP/1.1 503 Connection failed\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nKeep-Alive: timeout=30\r\n\r\n{}",
                body.len(),
                body
            )
        );

        let timeout = String::from_utf8(DefaultAnswer::GatewayTimeout.render(KEEP_ALIVE)).unwrap();
        assert!(timeout.starts_with("HTTP/1.1 504 Gateway timeout\r\n"));
        assert!(timeout.ends_with("\r\n\r\nError occurred while connecting to the remote host\n"));
        assert!(!DefaultAnswer::GatewayTimeout.closes_connection());

        let invalid = String::from_utf8(DefaultAnswer::InvalidResponse.render(KEEP_ALIVE)).unwrap();
        assert!(invalid.starts_with("HTTP/1.1 503 Invalid response\r\n"));
    }
}
