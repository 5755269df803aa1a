//! `data:` URL decoding (RFC 2397).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataUrlError {
    #[error("not a data: URL")]
    NotDataUrl,

    #[error("data: URL has no `,` separator")]
    MissingComma,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    /// Lowercased media type without parameters, `text/plain` when omitted
    pub media_type: String,
    pub body: String,
}

impl DataUrl {
    pub fn parse(url: &str) -> Result<Self, DataUrlError> {
        let rest = url
            .get(..5)
            .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
            .map(|_| &url[5..])
            .ok_or(DataUrlError::NotDataUrl)?;
        let (header, payload) = rest.split_once(',').ok_or(DataUrlError::MissingComma)?;

        let mut params = header.split(';').map(str::trim);
        let media_type = params
            .next()
            .filter(|m| !m.is_empty())
            .unwrap_or("text/plain")
            .to_ascii_lowercase();
        let is_base64 = params.any(|p| p.eq_ignore_ascii_case("base64"));

        let bytes = if is_base64 {
            let compact: String = percent_decode_str(payload)
                .decode_utf8()
                .map_err(|_| DataUrlError::NotUtf8)?
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            STANDARD.decode(compact)?
        } else {
            percent_decode_str(payload).collect()
        };
        let body = String::from_utf8(bytes).map_err(|_| DataUrlError::NotUtf8)?;
        Ok(Self { media_type, body })
    }

    pub fn is_typescript(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            "application/typescript" | "text/typescript" | "video/mp2t"
        )
    }

    pub fn is_json(&self) -> bool {
        self.media_type == "application/json" || self.media_type.ends_with("+json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encoded_payload() {
        let url = DataUrl::parse("data:text/javascript,postMessage(%22hi%22)").unwrap();
        assert_eq!(url.media_type, "text/javascript");
        assert_eq!(url.body, "postMessage(\"hi\")");
    }

    #[test]
    fn test_base64_payload_with_charset() {
        let url = DataUrl::parse("data:text/javascript;charset=utf-8;base64,cG9zdE1lc3NhZ2UoMSk=")
            .unwrap();
        assert_eq!(url.body, "postMessage(1)");
    }

    #[test]
    fn test_missing_media_type_defaults_to_text() {
        let url = DataUrl::parse("data:,a+b").unwrap();
        assert_eq!(url.media_type, "text/plain");
        assert_eq!(url.body, "a+b");
    }

    #[test]
    fn test_media_type_flags() {
        assert!(DataUrl::parse("data:application/typescript,let a: number = 1").unwrap().is_typescript());
        assert!(DataUrl::parse("data:application/json,{}").unwrap().is_json());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(DataUrl::parse("data:text/plain"), Err(DataUrlError::MissingComma)));
        assert!(matches!(DataUrl::parse("https://x"), Err(DataUrlError::NotDataUrl)));
        assert!(DataUrl::parse("data:;base64,!!!").is_err());
    }
}
