use std::net::SocketAddr;

/// A request with a `Content-Length` body, in origin form with a `Host` header
pub fn http_request<S1: Into<String>, S2: Into<String>, S3: Into<String>, S4: Into<String>>(
    method: S1,
    uri: S2,
    content: S3,
    host: S4,
) -> String {
    let content = content.into();
    format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{}",
        method.into(),
        uri.into(),
        host.into(),
        content.len(),
        content,
    )
}

pub fn connect_request(address: SocketAddr) -> String {
    format!("CONNECT {address} HTTP/1.1\r\nHost: {address}\r\n\r\n")
}

pub fn http_ok_response<S: Into<String>>(content: S) -> String {
    let content = content.into();
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        content.len(),
        content
    )
}

/// the status line of an answer written by the proxy itself
pub fn immutable_answer(status: u16) -> String {
    let reason = match status {
        200 => "Connection established",
        400 => "Bad request",
        503 => "Connection failed",
        504 => "Gateway timeout",
        _ => "",
    };
    format!("HTTP/1.1 {status} {reason}\r\n")
}

/// Whether `data` holds at least one complete response. Bodies delimited by
/// the connection close are complete as soon as the head is.
pub fn response_complete(data: &[u8]) -> bool {
    let Some(head_end) = data.windows(4).position(|window| window == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&data[..head_end]).to_ascii_lowercase();
    let body = &data[head_end + 4..];

    if head.contains("transfer-encoding: chunked") {
        return body.ends_with(b"0\r\n\r\n");
    }
    match head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|length| length.trim().parse::<usize>().ok())
    {
        Some(length) => body.len() >= length,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completeness() {
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n"));
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npo"));
        assert!(response_complete(http_ok_response("pong").as_bytes()));
        assert!(!response_complete(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npong\r\n"
        ));
        assert!(response_complete(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\npong\r\n0\r\n\r\n"
        ));
    }
}
