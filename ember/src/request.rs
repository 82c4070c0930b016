//! Line-oriented HTTP/1.1 request parser and the login/register flow.
//!
//! The parser advances RequestLine -> Headers -> Body -> Finish over the
//! connection's read buffer, never consuming a partial line. It is
//! re-entrant: a request split across reads keeps its intermediate state on
//! the connection until `Finish`.

use std::collections::HashMap;

use ember_pg::codec::escape_literal;
use ember_pg::PgPool;
use sha2::{Digest, Sha256};

use crate::buffer::Buffer;
use crate::error::{EmberError, EmberResult};
use crate::{log_debug, log_warn};

/// Paths that map onto the default HTML set; `/login` becomes
/// `/login.html` and so on.
const DEFAULT_HTML: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            _ => Method::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

pub struct HttpRequest {
    state: ParseState,
    method: Method,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    form: HashMap<String, String>,
    content_len: usize,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: Method::Unknown,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            form: HashMap::new(),
            content_len: 0,
        }
    }

    /// Reset for the next request on a keep-alive connection.
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Drive the state machine as far as the buffered bytes allow.
    /// `Ok(true)` means a complete request is available; `Ok(false)` means
    /// more bytes are needed; a malformed request is an error (HTTP 400).
    pub fn parse(
        &mut self,
        buff: &mut Buffer,
        db: Option<&PgPool>,
        max_body_bytes: usize,
    ) -> EmberResult<bool> {
        while buff.readable_bytes() > 0 && self.state != ParseState::Finish {
            match self.state {
                ParseState::RequestLine => {
                    let line = match take_line(buff) {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    self.parse_request_line(&line)?;
                    self.parse_path();
                }
                ParseState::Headers => {
                    let line = match take_line(buff) {
                        Some(line) => line,
                        None => return Ok(false),
                    };
                    if line.is_empty() {
                        self.content_len = self.parse_content_length(max_body_bytes)?;
                        if self.method == Method::Post && self.content_len > 0 {
                            self.state = ParseState::Body;
                        } else {
                            self.state = ParseState::Finish;
                        }
                    } else {
                        self.parse_header(&line)?;
                    }
                }
                ParseState::Body => {
                    if buff.readable_bytes() < self.content_len {
                        return Ok(false);
                    }
                    self.body =
                        String::from_utf8_lossy(&buff.peek()[..self.content_len]).into_owned();
                    buff.retrieve(self.content_len);
                    self.parse_post(db);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => {}
            }
        }
        Ok(self.state == ParseState::Finish)
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self
                .header("Connection")
                .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"))
    }

    fn parse_request_line(&mut self, line: &str) -> EmberResult<()> {
        let mut parts = line.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(p), Some(v), None) if !m.is_empty() && !p.is_empty() => (m, p, v),
            _ => return Err(EmberError::Parse(format!("bad request line: {:?}", line))),
        };
        let version = version
            .strip_prefix("HTTP/")
            .ok_or_else(|| EmberError::Parse(format!("bad version: {:?}", version)))?;

        self.method = Method::from_bytes(method.as_bytes());
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) -> EmberResult<()> {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| EmberError::Parse(format!("bad header line: {:?}", line)))?;
        self.headers
            .insert(key.to_string(), value.trim_start().to_string());
        Ok(())
    }

    fn parse_content_length(&self, max_body_bytes: usize) -> EmberResult<usize> {
        let value = match self.header("Content-Length") {
            Some(v) => v,
            None => return Ok(0),
        };
        let len: usize = value
            .trim()
            .parse()
            .map_err(|_| EmberError::Parse(format!("bad Content-Length: {:?}", value)))?;
        if len > max_body_bytes {
            return Err(EmberError::Parse(format!(
                "Content-Length {} exceeds limit {}",
                len, max_body_bytes
            )));
        }
        Ok(len)
    }

    fn parse_post(&mut self, db: Option<&PgPool>) {
        if self.method != Method::Post {
            return;
        }
        let form_encoded = self
            .header("Content-Type")
            .map_or(false, |v| v.eq_ignore_ascii_case("application/x-www-form-urlencoded"));
        if !form_encoded {
            return;
        }
        self.parse_from_urlencoded();

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return,
        };
        let name = self.form_value("username").unwrap_or("");
        let pwd = self.form_value("password").unwrap_or("");
        let verified = match db {
            Some(pool) => user_verify(pool, name, pwd, is_login),
            None => {
                log_warn!("database unavailable, rejecting auth for {:?}", name);
                false
            }
        };
        self.path = if verified {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }

    fn parse_from_urlencoded(&mut self) {
        for pair in self.body.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.form.insert(url_decode(key), url_decode(value));
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Consume one CRLF-terminated line from the buffer; `None` leaves a
/// partial line untouched.
fn take_line(buff: &mut Buffer) -> Option<String> {
    let data = buff.peek();
    let pos = data.windows(2).position(|w| w == b"\r\n")?;
    let line = String::from_utf8_lossy(&data[..pos]).into_owned();
    buff.retrieve(pos + 2);
    Some(line)
}

/// Percent-decoding with `+` mapped to space. Stray `%` sequences are kept
/// verbatim rather than rejected.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// SHA-256 hex digest used for the stored password column.
pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Check credentials (login) or create the account (register).
/// Database failures degrade to `false` and a WARN line; the pooled handle
/// is returned on every path by the guard.
pub fn user_verify(db: &PgPool, name: &str, pwd: &str, is_login: bool) -> bool {
    if name.is_empty() || pwd.is_empty() {
        return false;
    }
    let mut conn = match db.acquire() {
        Ok(conn) => conn,
        Err(e) => {
            log_warn!("db acquire failed: {}", e);
            return false;
        }
    };

    let lookup = format!(
        "SELECT password FROM \"user\" WHERE username = '{}'",
        escape_literal(name)
    );
    let rows = match conn.query(&lookup) {
        Ok(rows) => rows,
        Err(e) => {
            log_warn!("user lookup failed: {}", e);
            return false;
        }
    };

    let digest = password_digest(pwd);
    if is_login {
        return rows
            .first()
            .and_then(|row| row.get(0))
            .map_or(false, |stored| stored == digest);
    }

    if !rows.is_empty() {
        log_debug!("register rejected, username {:?} taken", name);
        return false;
    }
    let insert = format!(
        "INSERT INTO \"user\"(username, password) VALUES ('{}', '{}')",
        escape_literal(name),
        digest
    );
    match conn.execute(&insert) {
        Ok(n) => n > 0,
        Err(e) => {
            log_warn!("user insert failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(req: &mut HttpRequest, bytes: &[u8]) -> EmberResult<bool> {
        let mut buff = Buffer::new();
        buff.append(bytes);
        req.parse(&mut buff, None, 1 << 20)
    }

    #[test]
    fn parses_complete_get_request() {
        let mut req = HttpRequest::new();
        let done = feed(
            &mut req,
            b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert!(done);
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/index.html"); // "/" rewritten
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert!(req.is_keep_alive());
    }

    #[test]
    fn default_html_paths_gain_suffix() {
        for (raw, expect) in [
            ("/login", "/login.html"),
            ("/welcome", "/welcome.html"),
            ("/picture", "/picture.html"),
            ("/other", "/other"),
        ] {
            let mut req = HttpRequest::new();
            let text = format!("GET {} HTTP/1.1\r\n\r\n", raw);
            assert!(feed(&mut req, text.as_bytes()).unwrap());
            assert_eq!(req.path(), expect);
        }
    }

    #[test]
    fn request_split_across_reads_keeps_state() {
        let mut req = HttpRequest::new();
        let mut buff = Buffer::new();

        buff.append(b"GET /welcome HT");
        assert!(!req.parse(&mut buff, None, 1 << 20).unwrap());
        // partial request line was not consumed
        assert_eq!(buff.readable_bytes(), 15);

        buff.append(b"TP/1.1\r\nHost: x\r");
        assert!(!req.parse(&mut buff, None, 1 << 20).unwrap());

        buff.append(b"\n\r\n");
        assert!(req.parse(&mut buff, None, 1 << 20).unwrap());
        assert_eq!(req.path(), "/welcome.html");
        assert_eq!(req.header("Host"), Some("x"));
        assert_eq!(buff.readable_bytes(), 0); // consumed exactly the request
    }

    #[test]
    fn pipelined_leftover_stays_in_buffer() {
        let mut req = HttpRequest::new();
        let mut buff = Buffer::new();
        buff.append(b"GET / HTTP/1.1\r\n\r\nGET /next HTTP/1.1\r\n");
        assert!(req.parse(&mut buff, None, 1 << 20).unwrap());
        assert_eq!(buff.peek(), b"GET /next HTTP/1.1\r\n");
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let cases: [&[u8]; 4] = [
            b"GARBAGE\r\n\r\n",
            b"GET /\r\n\r\n",
            b"GET / SPDY/3\r\n\r\n",
            b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n",
        ];
        for case in cases {
            let mut req = HttpRequest::new();
            assert!(feed(&mut req, case).is_err(), "case {:?}", case);
        }
    }

    #[test]
    fn post_form_is_decoded() {
        let mut req = HttpRequest::new();
        let body = "a=1&msg=hello+world%21&empty=";
        let text = format!(
            "POST /submit HTTP/1.1\r\nContent-Length: {}\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n{}",
            body.len(),
            body
        );
        assert!(feed(&mut req, text.as_bytes()).unwrap());
        assert_eq!(req.form_value("a"), Some("1"));
        assert_eq!(req.form_value("msg"), Some("hello world!"));
        assert_eq!(req.form_value("empty"), Some(""));
    }

    #[test]
    fn post_body_waits_for_content_length() {
        let mut req = HttpRequest::new();
        let mut buff = Buffer::new();
        buff.append(
            b"POST /x HTTP/1.1\r\nContent-Length: 10\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nabc",
        );
        assert!(!req.parse(&mut buff, None, 1 << 20).unwrap());
        buff.append(b"d=1&e=2");
        assert!(req.parse(&mut buff, None, 1 << 20).unwrap());
        assert_eq!(req.form_value("e"), Some("2"));
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let mut req = HttpRequest::new();
        let text = b"POST /x HTTP/1.1\r\nContent-Length: 999999999\r\n\r\n";
        let mut buff = Buffer::new();
        buff.append(text);
        assert!(req.parse(&mut buff, None, 1024).is_err());
    }

    #[test]
    fn login_without_database_degrades_to_error_page() {
        let mut req = HttpRequest::new();
        let body = "username=alice&password=secret";
        let text = format!(
            "POST /login HTTP/1.1\r\nContent-Length: {}\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n{}",
            body.len(),
            body
        );
        assert!(feed(&mut req, text.as_bytes()).unwrap());
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn urlencoded_round_trip() {
        fn encode(s: &str) -> String {
            let mut out = String::new();
            for b in s.bytes() {
                match b {
                    b' ' => out.push('+'),
                    b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                        out.push(b as char)
                    }
                    other => out.push_str(&format!("%{:02X}", other)),
                }
            }
            out
        }

        for value in ["plain", "with space", "sym=&bols%", "端"] {
            assert_eq!(url_decode(&encode(value)), value, "value {:?}", value);
        }
    }

    #[test]
    fn password_digest_is_stable_hex() {
        let d = password_digest("secret");
        assert_eq!(d.len(), 64);
        assert_eq!(d, password_digest("secret"));
        assert_ne!(d, password_digest("Secret"));
        assert!(d.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
