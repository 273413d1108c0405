//! The framed request/response protocol spoken between peers.
//!
//! The framing follows the bulk-string scheme RESP made popular, because it is trivial
//! to parse incrementally from a network buffer: a request is an array of exactly two
//! bulk strings (group, key), a response is either one bulk string carrying the raw
//! value bytes or an error line.
//!
//! ```text
//! request:   *2\r\n$6\r\nscores\r\n$3\r\nTom\r\n
//! response:  $3\r\n630\r\n
//! error:     -not found: Tom not exist\r\n
//! ```
//!
//! The parsers cope with partial frames (returning **None** so the caller keeps
//! reading) and report malformed data as hard errors, upon which the connection is
//! closed. All parsing works on byte offsets within the given buffer; on success the
//! number of consumed bytes is returned so the caller can advance its buffer.
use anyhow::{anyhow, Result};
use bytes::{BufMut, BytesMut};

/// A request for the value of `key` within the group named `group`.
#[derive(Debug, PartialEq, Eq)]
pub struct GetRequest {
    pub group: String,
    pub key: String,
}

/// The answer to a [GetRequest]: the raw value bytes or an error message.
#[derive(Debug, PartialEq, Eq)]
pub enum GetResponse {
    Value(Vec<u8>),
    Error(String),
}

/// Locates the next CRLF at or after `from`.
fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|position| from + position)
}

/// Parses the decimal payload of a header line.
fn parse_length(digits: &[u8]) -> Result<usize> {
    if digits.is_empty() {
        return Err(anyhow!("empty length field"));
    }
    let mut value: usize = 0;
    for digit in digits {
        if !digit.is_ascii_digit() {
            return Err(anyhow!("malformed length field"));
        }
        value = value
            .checked_mul(10)
            .and_then(|value| value.checked_add((digit - b'0') as usize))
            .ok_or_else(|| anyhow!("length field out of range"))?;
    }
    Ok(value)
}

/// Reads one bulk string (`$<len>\r\n<bytes>\r\n`) starting at `offset`.
///
/// Returns the content and the offset of the byte following the frame, or **None** if
/// the buffer does not hold the full bulk string yet.
fn read_bulk(data: &[u8], offset: usize) -> Result<Option<(Vec<u8>, usize)>> {
    let header_end = match find_crlf(data, offset) {
        Some(position) => position,
        None => return Ok(None),
    };
    if data[offset] != b'$' {
        return Err(anyhow!("expected a bulk string"));
    }

    let length = parse_length(&data[offset + 1..header_end])?;
    let content_start = header_end + 2;
    let content_end = content_start
        .checked_add(length)
        .ok_or_else(|| anyhow!("length field out of range"))?;
    if data.len() < content_end + 2 {
        return Ok(None);
    }
    if &data[content_end..content_end + 2] != b"\r\n" {
        return Err(anyhow!("bulk string is not terminated by CRLF"));
    }

    Ok(Some((data[content_start..content_end].to_vec(), content_end + 2)))
}

impl GetRequest {
    /// Serializes the request into the given buffer.
    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_slice(format!("*2\r\n${}\r\n", self.group.len()).as_bytes());
        buffer.put_slice(self.group.as_bytes());
        buffer.put_slice(format!("\r\n${}\r\n", self.key.len()).as_bytes());
        buffer.put_slice(self.key.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    /// Tries to parse a request from the beginning of the given buffer.
    ///
    /// Returns the request and the number of consumed bytes, **None** for a partial
    /// frame, or an error for malformed data.
    pub fn parse(data: &[u8]) -> Result<Option<(GetRequest, usize)>> {
        let header_end = match find_crlf(data, 0) {
            Some(position) => position,
            None => return Ok(None),
        };
        if data[0] != b'*' {
            return Err(anyhow!("a request must be an array of bulk strings"));
        }
        let fields = parse_length(&data[1..header_end])?;
        if fields != 2 {
            return Err(anyhow!("expected two request fields (group, key), got {}", fields));
        }

        let (group, offset) = match read_bulk(data, header_end + 2)? {
            Some(result) => result,
            None => return Ok(None),
        };
        let (key, offset) = match read_bulk(data, offset)? {
            Some(result) => result,
            None => return Ok(None),
        };

        let request = GetRequest {
            group: String::from_utf8(group).map_err(|_| anyhow!("group name is not UTF-8"))?,
            key: String::from_utf8(key).map_err(|_| anyhow!("key is not UTF-8"))?,
        };
        Ok(Some((request, offset)))
    }
}

impl GetResponse {
    /// Serializes the response into the given buffer.
    ///
    /// Line breaks within error messages are flattened so that the error stays a
    /// single protocol line.
    pub fn encode(&self, buffer: &mut BytesMut) {
        match self {
            GetResponse::Value(bytes) => {
                buffer.put_slice(format!("${}\r\n", bytes.len()).as_bytes());
                buffer.put_slice(bytes);
                buffer.put_slice(b"\r\n");
            }
            GetResponse::Error(message) => {
                let message = message.replace(['\r', '\n'], " ");
                buffer.put_slice(b"-");
                buffer.put_slice(message.as_bytes());
                buffer.put_slice(b"\r\n");
            }
        }
    }

    /// Tries to parse a response from the beginning of the given buffer.
    pub fn parse(data: &[u8]) -> Result<Option<(GetResponse, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }

        match data[0] {
            b'$' => Ok(read_bulk(data, 0)?
                .map(|(bytes, consumed)| (GetResponse::Value(bytes), consumed))),
            b'-' => {
                let line_end = match find_crlf(data, 0) {
                    Some(position) => position,
                    None => return Ok(None),
                };
                let message = String::from_utf8_lossy(&data[1..line_end]).into_owned();
                Ok(Some((GetResponse::Error(message), line_end + 2)))
            }
            _ => Err(anyhow!("a response must be a bulk string or an error line")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_request(group: &str, key: &str) -> BytesMut {
        let mut buffer = BytesMut::new();
        GetRequest {
            group: group.to_owned(),
            key: key.to_owned(),
        }
        .encode(&mut buffer);
        buffer
    }

    #[test]
    fn requests_survive_a_round_trip() {
        let buffer = encoded_request("scores", "Tom");
        assert_eq!(&buffer[..], b"*2\r\n$6\r\nscores\r\n$3\r\nTom\r\n");

        let (request, consumed) = GetRequest::parse(&buffer).unwrap().unwrap();
        assert_eq!(request.group, "scores");
        assert_eq!(request.key, "Tom");
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn partial_requests_ask_for_more_data() {
        let buffer = encoded_request("scores", "Tom");

        for cut in 0..buffer.len() {
            assert!(
                GetRequest::parse(&buffer[..cut]).unwrap().is_none(),
                "a prefix of {} bytes should be partial",
                cut
            );
        }
    }

    #[test]
    fn trailing_bytes_are_left_in_the_buffer() {
        let mut buffer = encoded_request("scores", "Tom");
        let first_len = buffer.len();
        GetRequest {
            group: "scores".to_owned(),
            key: "Jack".to_owned(),
        }
        .encode(&mut buffer);

        let (request, consumed) = GetRequest::parse(&buffer).unwrap().unwrap();
        assert_eq!(request.key, "Tom");
        assert_eq!(consumed, first_len);

        let (request, _) = GetRequest::parse(&buffer[consumed..]).unwrap().unwrap();
        assert_eq!(request.key, "Jack");
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(GetRequest::parse(b"$3\r\nTom\r\n").is_err());
        assert!(GetRequest::parse(b"*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n").is_err());
        assert!(GetRequest::parse(b"*2\r\n$x\r\n").is_err());
        assert!(GetRequest::parse(b"*2\r\n$3\r\nTomXX$3\r\nabc\r\n").is_err());
    }

    #[test]
    fn value_responses_survive_a_round_trip() {
        let mut buffer = BytesMut::new();
        GetResponse::Value(b"630".to_vec()).encode(&mut buffer);
        assert_eq!(&buffer[..], b"$3\r\n630\r\n");

        let (response, consumed) = GetResponse::parse(&buffer).unwrap().unwrap();
        assert_eq!(response, GetResponse::Value(b"630".to_vec()));
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn binary_values_are_transported_verbatim() {
        let payload = vec![0u8, 13, 10, 255, 42];
        let mut buffer = BytesMut::new();
        GetResponse::Value(payload.clone()).encode(&mut buffer);

        let (response, _) = GetResponse::parse(&buffer).unwrap().unwrap();
        assert_eq!(response, GetResponse::Value(payload));
    }

    #[test]
    fn error_responses_are_single_lines() {
        let mut buffer = BytesMut::new();
        GetResponse::Error("not found:\r\nTom".to_owned()).encode(&mut buffer);
        assert_eq!(&buffer[..], b"-not found:  Tom\r\n");

        let (response, _) = GetResponse::parse(&buffer).unwrap().unwrap();
        assert_eq!(response, GetResponse::Error("not found:  Tom".to_owned()));
    }

    #[test]
    fn partial_responses_ask_for_more_data() {
        assert!(GetResponse::parse(b"").unwrap().is_none());
        assert!(GetResponse::parse(b"$3\r\n63").unwrap().is_none());
        assert!(GetResponse::parse(b"-oops").unwrap().is_none());
        assert!(GetResponse::parse(b"+OK\r\n").is_err());
    }
}
