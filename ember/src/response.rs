//! HTTP response assembly: status resolution via stat, header block, and a
//! zero-copy mmap'd file payload.
//!
//! The header block is appended to the connection's write buffer; the file
//! body stays out-of-line as a read-only private mapping so the connection
//! can hand both regions to one vectored write.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::buffer::Buffer;
use crate::syscalls;

/// A read-only private file mapping, released exactly once.
pub struct MappedFile {
    ptr: *mut u8,
    len: usize,
}

impl MappedFile {
    fn map(file: &File, len: usize) -> io::Result<Self> {
        let ptr = syscalls::mmap_readonly(file.as_raw_fd(), len)?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// The mapping is exclusively owned and PROT_READ; moving it between the
// reactor and a worker is sound.
unsafe impl Send for MappedFile {}

impl Drop for MappedFile {
    fn drop(&mut self) {
        syscalls::munmap(self.ptr, self.len);
    }
}

pub struct HttpResponse {
    code: Option<u16>,
    keep_alive: bool,
    src_dir: PathBuf,
    path: String,
    mapped: Option<MappedFile>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: None,
            keep_alive: false,
            src_dir: PathBuf::new(),
            path: String::new(),
            mapped: None,
        }
    }

    /// Prepare for a fresh response. `code` of `None` lets the stat checks
    /// decide; parse failures preset 400.
    pub fn init(&mut self, src_dir: &Path, path: String, keep_alive: bool, code: Option<u16>) {
        self.unmap_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.src_dir = src_dir.to_path_buf();
        self.path = path;
    }

    /// Resolve the target file and assemble status line, headers, and
    /// payload mapping into `buff`.
    pub fn make_response(&mut self, buff: &mut Buffer) {
        if self.code.is_none() {
            self.code = Some(match fs::metadata(self.full_path()) {
                Err(_) => 404,
                Ok(md) if md.is_dir() => 404,
                Ok(md) if md.permissions().mode() & 0o004 == 0 => 403,
                Ok(_) => 200,
            });
        }
        self.error_html();
        self.add_state_line(buff);
        self.add_header(buff);
        self.add_content(buff);
    }

    pub fn code(&self) -> u16 {
        self.code.unwrap_or(0)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The mapped payload, if the target file was mapped.
    pub fn file(&self) -> Option<&MappedFile> {
        self.mapped.as_ref()
    }

    pub fn file_len(&self) -> usize {
        self.mapped.as_ref().map_or(0, MappedFile::len)
    }

    pub fn unmap_file(&mut self) {
        self.mapped = None;
    }

    fn full_path(&self) -> PathBuf {
        self.src_dir.join(self.path.trim_start_matches('/'))
    }

    /// Swap the path for the static error page of 400/403/404.
    fn error_html(&mut self) {
        if let Some(page) = self.code.and_then(code_path) {
            self.path = page.to_string();
        }
    }

    fn add_state_line(&mut self, buff: &mut Buffer) {
        let code = self.code.unwrap_or(400);
        let status = match code_status(code) {
            Some(status) => status,
            None => {
                self.code = Some(400);
                "Bad Request"
            }
        };
        buff.append_str(&format!("HTTP/1.1 {} {}\r\n", self.code.unwrap_or(400), status));
    }

    fn add_header(&mut self, buff: &mut Buffer) {
        buff.append_str("Connection: ");
        if self.keep_alive {
            buff.append_str("keep-alive\r\n");
            buff.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buff.append_str("close\r\n");
        }
        buff.append_str(&format!("Content-type: {}\r\n", self.file_type()));
    }

    fn add_content(&mut self, buff: &mut Buffer) {
        let file = match File::open(self.full_path()) {
            Ok(file) => file,
            Err(_) => {
                self.error_content(buff, "File NotFound!");
                return;
            }
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0) as usize;
        if len == 0 {
            // mmap rejects zero-length regions; headers alone suffice
            buff.append_str("Content-length: 0\r\n\r\n");
            return;
        }
        match MappedFile::map(&file, len) {
            Ok(mapped) => {
                self.mapped = Some(mapped);
                buff.append_str(&format!("Content-length: {}\r\n\r\n", len));
            }
            Err(_) => self.error_content(buff, "File NotFound!"),
        }
        // source descriptor closes here; the mapping outlives it
    }

    /// Inline HTML body used when the target cannot be opened or mapped.
    fn error_content(&self, buff: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = code_status(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>ember</em></body></html>",
            code, status, message
        );
        buff.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buff.append_str(&body);
    }

    fn file_type(&self) -> &'static str {
        let suffix = match self.path.rfind('.') {
            Some(idx) => &self.path[idx..],
            None => return "text/plain",
        };
        match suffix {
            ".html" => "text/html",
            ".xml" => "text/xml",
            ".xhtml" => "application/xhtml+xml",
            ".txt" => "text/plain",
            ".rtf" => "application/rtf",
            ".pdf" => "application/pdf",
            ".word" => "application/nsword",
            ".png" => "image/png",
            ".gif" => "image/gif",
            ".jpg" | ".jpeg" => "image/jpeg",
            ".au" => "audio/basic",
            ".mpeg" | ".mpg" => "video/mpeg",
            ".avi" => "video/x-msvideo",
            ".gz" => "application/x-gzip",
            ".tar" => "application/x-tar",
            ".css" => "text/css",
            ".js" => "text/javascript",
            _ => "text/plain",
        }
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

fn code_status(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

fn code_path(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html>home</html>").unwrap();
        fs::write(dir.path().join("404.html"), "<html>missing</html>").unwrap();
        fs::write(dir.path().join("403.html"), "<html>forbidden</html>").unwrap();
        dir
    }

    fn render(dir: &Path, path: &str, keep_alive: bool, code: Option<u16>) -> (HttpResponse, String) {
        let mut resp = HttpResponse::new();
        resp.init(dir, path.to_string(), keep_alive, code);
        let mut buff = Buffer::new();
        resp.make_response(&mut buff);
        let head = String::from_utf8_lossy(buff.peek()).into_owned();
        (resp, head)
    }

    #[test]
    fn serves_existing_file_with_mapping() {
        let dir = setup();
        let (resp, head) = render(dir.path(), "/index.html", true, None);
        assert_eq!(resp.code(), 200);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("keep-alive: max=6, timeout=120\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.contains("Content-length: 17\r\n\r\n"));
        assert_eq!(resp.file().unwrap().as_slice(), b"<html>home</html>");
    }

    #[test]
    fn missing_file_serves_404_page() {
        let dir = setup();
        let (resp, head) = render(dir.path(), "/nope.html", false, None);
        assert_eq!(resp.code(), 404);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(resp.file().unwrap().as_slice(), b"<html>missing</html>");
    }

    #[test]
    fn directory_target_is_404() {
        let dir = setup();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let (resp, _) = render(dir.path(), "/sub", false, None);
        assert_eq!(resp.code(), 404);
    }

    #[test]
    fn unreadable_file_is_403() {
        let dir = setup();
        let secret = dir.path().join("secret.html");
        fs::write(&secret, "top secret").unwrap();
        let mut perms = fs::metadata(&secret).unwrap().permissions();
        perms.set_mode(0o640); // no world-read bit
        fs::set_permissions(&secret, perms).unwrap();

        let (resp, head) = render(dir.path(), "/secret.html", false, None);
        assert_eq!(resp.code(), 403);
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(resp.file().unwrap().as_slice(), b"<html>forbidden</html>");
    }

    #[test]
    fn preset_bad_request_keeps_400() {
        let dir = setup();
        // no 400.html on disk: falls back to the inline error body
        let (resp, head) = render(dir.path(), "/whatever", false, Some(400));
        assert_eq!(resp.code(), 400);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("<p>File NotFound!</p>"));
        assert!(resp.file().is_none());
    }

    #[test]
    fn empty_file_sends_headers_only() {
        let dir = setup();
        fs::write(dir.path().join("empty.html"), "").unwrap();
        let (resp, head) = render(dir.path(), "/empty.html", false, None);
        assert_eq!(resp.code(), 200);
        assert!(head.contains("Content-length: 0\r\n\r\n"));
        assert!(resp.file().is_none());
    }

    #[test]
    fn mime_table_by_suffix() {
        let dir = setup();
        for (name, mime) in [
            ("a.css", "text/css"),
            ("a.js", "text/javascript"),
            ("a.png", "image/png"),
            ("a.bin", "text/plain"),
            ("noext", "text/plain"),
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
            let (_, head) = render(dir.path(), &format!("/{}", name), false, None);
            assert!(
                head.contains(&format!("Content-type: {}\r\n", mime)),
                "{} => {}",
                name,
                mime
            );
        }
    }
}
