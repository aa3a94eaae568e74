use std::fmt;

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, url: String },
    Response { status_code: u16, status: String },
}

/// An HTTP/1 message head. Header names keep their case and order; lookups
/// ignore case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start: StartLine,
    /// minor version, `HTTP/1.<version>`
    pub version: u8,
    headers: Vec<(String, String)>,
}

impl HttpMessage {
    pub fn request(method: &str, url: &str) -> Self {
        HttpMessage {
            start: StartLine::Request {
                method: method.to_owned(),
                url: url.to_owned(),
            },
            version: 1,
            headers: Vec::new(),
        }
    }

    pub fn response(status_code: u16, status: &str) -> Self {
        HttpMessage {
            start: StartLine::Response {
                status_code,
                status: status.to_owned(),
            },
            version: 1,
            headers: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { url, .. } => Some(url),
            StartLine::Response { .. } => None,
        }
    }

    pub fn set_url(&mut self, new_url: &str) {
        if let StartLine::Request { url, .. } = &mut self.start {
            *url = new_url.to_owned();
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status_code, .. } => Some(*status_code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn set_status_code(&mut self, code: u16) {
        if let StartLine::Response { status_code, .. } = &mut self.start {
            *status_code = code;
        }
    }

    pub fn status(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn set_status(&mut self, reason: &str) {
        if let StartLine::Response { status, .. } = &mut self.start {
            *status = reason.to_owned();
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// value of the first header with this name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    /// removes every header with this name, returns how many were removed
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    /// Replaces the value of the first header with this name, removing the
    /// others. Adds it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.headers[index].1 = value.to_owned();
                let mut seen = 0;
                self.headers.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.add_header(name, value),
        }
    }

    /// the last transfer coding is `chunked`
    pub fn is_chunked(&self) -> bool {
        self.header_values("Transfer-Encoding")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|coding| !coding.is_empty())
            .last()
            .map(|coding| coding.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, url } => {
                write!(f, "{} {} HTTP/1.{}\r\n", method, url, self.version)?
            }
            StartLine::Response {
                status_code,
                status,
            } => write!(f, "HTTP/1.{} {} {}\r\n", self.version, status_code, status)?,
        }
        for (name, value) in &self.headers {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "\r\n")
    }
}
