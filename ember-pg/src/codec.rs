//! Wire-format helpers for the PostgreSQL frontend/backend protocol.
//!
//! Frontend messages are length-prefixed; the length field counts itself
//! but not the one-byte tag. The startup message has no tag at all.

use md5::{Digest, Md5};

use crate::error::{PgError, PgResult};

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196_608;

/// Append the untagged StartupMessage for `user`/`database`.
pub fn encode_startup(out: &mut Vec<u8>, user: &str, database: &str) {
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]); // patched below
    out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    write_cstr(out, "user");
    write_cstr(out, user);
    write_cstr(out, "database");
    write_cstr(out, database);
    out.push(0);
    patch_len(out, start);
}

/// Append a PasswordMessage (`p`) carrying `password`.
pub fn encode_password(out: &mut Vec<u8>, password: &str) {
    out.push(b'p');
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    write_cstr(out, password);
    patch_len(out, start);
}

/// Append a simple Query message (`Q`).
pub fn encode_query(out: &mut Vec<u8>, sql: &str) {
    out.push(b'Q');
    let start = out.len();
    out.extend_from_slice(&[0, 0, 0, 0]);
    write_cstr(out, sql);
    patch_len(out, start);
}

/// Append a Terminate message (`X`).
pub fn encode_terminate(out: &mut Vec<u8>) {
    out.push(b'X');
    out.extend_from_slice(&4i32.to_be_bytes());
}

/// Compute the response to an MD5Password challenge:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(user.as_bytes());
    let inner = hex(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(&hasher.finalize()))
}

/// Escape a string for interpolation into a simple-query literal.
/// Single quotes are doubled; NUL bytes are stripped (the wire format
/// cannot carry them inside a C string anyway).
pub fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\0' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Read a NUL-terminated string starting at `pos`; returns the string and
/// the index one past the terminator.
pub fn read_cstr(buf: &[u8], pos: usize) -> PgResult<(String, usize)> {
    let tail = buf
        .get(pos..)
        .ok_or_else(|| PgError::Protocol("truncated string".into()))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("unterminated string".into()))?;
    let s = String::from_utf8_lossy(&tail[..end]).into_owned();
    Ok((s, pos + end + 1))
}

pub fn read_i32(buf: &[u8], pos: usize) -> PgResult<i32> {
    let bytes: [u8; 4] = buf
        .get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PgError::Protocol("truncated i32".into()))?;
    Ok(i32::from_be_bytes(bytes))
}

pub fn read_i16(buf: &[u8], pos: usize) -> PgResult<i16> {
    let bytes: [u8; 2] = buf
        .get(pos..pos + 2)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| PgError::Protocol("truncated i16".into()))?;
    Ok(i16::from_be_bytes(bytes))
}

fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn patch_len(out: &mut Vec<u8>, start: usize) {
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_frame_layout() {
        let mut buf = Vec::new();
        encode_startup(&mut buf, "alice", "webdb");
        // length counts the whole message
        assert_eq!(read_i32(&buf, 0).unwrap() as usize, buf.len());
        assert_eq!(read_i32(&buf, 4).unwrap(), 196_608);
        let (key, pos) = read_cstr(&buf, 8).unwrap();
        assert_eq!(key, "user");
        let (val, _) = read_cstr(&buf, pos).unwrap();
        assert_eq!(val, "alice");
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn query_frame_layout() {
        let mut buf = Vec::new();
        encode_query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], b'Q');
        // tag is not counted by the length field
        assert_eq!(read_i32(&buf, 1).unwrap() as usize, buf.len() - 1);
        let (sql, _) = read_cstr(&buf, 5).unwrap();
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn md5_password_shape() {
        let resp = md5_password("alice", "secret", [1, 2, 3, 4]);
        assert!(resp.starts_with("md5"));
        assert_eq!(resp.len(), 35);
        assert!(resp[3..].bytes().all(|b| b.is_ascii_hexdigit()));
        // deterministic for fixed inputs
        assert_eq!(resp, md5_password("alice", "secret", [1, 2, 3, 4]));
        assert_ne!(resp, md5_password("alice", "secret", [4, 3, 2, 1]));
    }

    #[test]
    fn escape_doubles_quotes() {
        assert_eq!(escape_literal("o'brien"), "o''brien");
        assert_eq!(escape_literal("a\0b"), "ab");
        assert_eq!(escape_literal("plain"), "plain");
    }
}
