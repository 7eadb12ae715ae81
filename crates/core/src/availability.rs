//! Availability tests for bound-layer tiles.
//!
//! Imagery servers often answer "no tile here" with a placeholder rather
//! than a clean error: a specific status code, a specific content type, or
//! an empty-sea image of a fixed size. A resource carrying an
//! [`AvailabilityTest`] treats such a reply as "unavailable" instead of a
//! failure, so the renderer can fall back to a coarser tile.

use std::collections::BTreeSet;

use mapstream_scheduler::{FetchError, FetchReply};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityTest {
    /// Any of these HTTP codes means "not available"
    NegativeCode(BTreeSet<u16>),
    /// This content type means "not available"
    NegativeType(String),
    /// A body of exactly this many bytes means "not available"
    NegativeSize(usize),
}

impl AvailabilityTest {
    pub fn negative_codes(codes: impl IntoIterator<Item = u16>) -> Self {
        AvailabilityTest::NegativeCode(codes.into_iter().collect())
    }

    /// Describes why `reply` counts as unavailable, if it does.
    pub fn check_reply(&self, reply: &FetchReply) -> Option<String> {
        match self {
            AvailabilityTest::NegativeCode(codes) if codes.contains(&reply.http_code) => {
                Some(format!("HTTP {}", reply.http_code))
            }
            AvailabilityTest::NegativeType(content_type) => {
                let actual = reply.content_type.as_deref()?;
                // Ignore parameters such as "; charset=..."
                let mime = actual.split(';').next().unwrap_or(actual).trim();
                mime.eq_ignore_ascii_case(content_type)
                    .then(|| format!("content type {mime}"))
            }
            AvailabilityTest::NegativeSize(size) if reply.bytes.len() == *size => {
                Some(format!("body of {size} bytes"))
            }
            _ => None,
        }
    }

    /// Describes why a failed fetch counts as unavailable, if it does.
    pub fn check_error(&self, error: &FetchError) -> Option<String> {
        match (self, error) {
            (AvailabilityTest::NegativeCode(codes), FetchError::HttpStatus(code))
                if codes.contains(code) =>
            {
                Some(format!("HTTP {code}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapstream_cache::ByteBuffer;

    #[test]
    fn test_negative_code() {
        let test = AvailabilityTest::negative_codes([403, 404]);
        assert!(test.check_error(&FetchError::HttpStatus(404)).is_some());
        assert!(test.check_error(&FetchError::HttpStatus(500)).is_none());
        assert!(test.check_error(&FetchError::Timeout).is_none());
        assert!(test.check_reply(&FetchReply::ok(ByteBuffer::from(vec![1]))).is_none());
    }

    #[test]
    fn test_negative_type_ignores_parameters() {
        let test = AvailabilityTest::NegativeType("text/html".to_string());
        let reply = FetchReply::ok(ByteBuffer::from(vec![1])).with_content_type("text/html; charset=utf-8");
        assert_eq!(test.check_reply(&reply).as_deref(), Some("content type text/html"));

        let image = FetchReply::ok(ByteBuffer::from(vec![1])).with_content_type("image/jpeg");
        assert!(test.check_reply(&image).is_none());

        let untyped = FetchReply::ok(ByteBuffer::from(vec![1]));
        assert!(test.check_reply(&untyped).is_none());
    }

    #[test]
    fn test_negative_size() {
        let test = AvailabilityTest::NegativeSize(3);
        assert!(test.check_reply(&FetchReply::ok(ByteBuffer::from(vec![0; 3]))).is_some());
        assert!(test.check_reply(&FetchReply::ok(ByteBuffer::from(vec![0; 4]))).is_none());
    }
}
