//! Worker-side response compression.
//!
//! Applies to 200 string responses whose content type matches the
//! configured pattern, when the caller advertised a supported encoding.
//! Preference order: brotli, then gzip, then deflate.

use crate::protocol::{Body, BodyKind, WireResponse};
use crate::http::status;
use regex::Regex;
use std::io::Write;

/// Compression settings resolved from the pool config at startup.
pub struct CompressConfig {
    pub enabled: bool,
    pub types: Regex,
}

impl CompressConfig {
    pub fn new(enabled: bool, types_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            enabled,
            types: Regex::new(types_pattern)?,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            types: Regex::new("^$").expect("static regex"),
        }
    }
}

/// A negotiated content encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Brotli,
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn content_encoding(self) -> &'static str {
        match self {
            Encoding::Brotli => "br",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Pick the preferred encoding advertised by an `Accept-Encoding` value.
fn choose(accept_encoding: &str) -> Option<Encoding> {
    let advertised: Vec<&str> = accept_encoding
        .split(',')
        .map(|token| token.split(';').next().unwrap_or("").trim())
        .collect();
    if advertised.iter().any(|t| t.eq_ignore_ascii_case("br")) {
        Some(Encoding::Brotli)
    } else if advertised.iter().any(|t| t.eq_ignore_ascii_case("gzip")) {
        Some(Encoding::Gzip)
    } else if advertised.iter().any(|t| t.eq_ignore_ascii_case("deflate")) {
        Some(Encoding::Deflate)
    } else {
        None
    }
}

fn header<'a>(resp: &'a WireResponse, name: &str) -> Option<&'a str> {
    resp.headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Decide whether a response is eligible for compression, and with which
/// encoding.
pub fn eligible(
    resp: &WireResponse,
    accept_encoding: &str,
    config: &CompressConfig,
) -> Option<Encoding> {
    if !config.enabled {
        return None;
    }
    if resp.status != status::OK {
        return None;
    }
    if resp.kind != BodyKind::String || resp.body.is_empty() {
        return None;
    }
    if header(resp, "content-encoding").is_some() {
        return None;
    }
    let content_type = header(resp, "content-type")?;
    if !config.types.is_match(content_type) {
        return None;
    }
    choose(accept_encoding)
}

/// Compress the string body in place: the body becomes a binary blob and
/// `Content-Encoding` is set.
pub fn apply(resp: &mut WireResponse, encoding: Encoding) -> Result<(), String> {
    let text = match &resp.body {
        Body::Text(text) => text.as_bytes(),
        _ => return Err("compression applies to string bodies only".to_string()),
    };

    let compressed = match encoding {
        Encoding::Brotli => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(text).map_err(|e| e.to_string())?;
            writer.flush().map_err(|e| e.to_string())?;
            drop(writer);
            out
        }
        Encoding::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(text).map_err(|e| e.to_string())?;
            encoder.finish().map_err(|e| e.to_string())?
        }
        Encoding::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(text).map_err(|e| e.to_string())?;
            encoder.finish().map_err(|e| e.to_string())?
        }
    };

    resp.headers.insert(
        "Content-Encoding".to_string(),
        encoding.content_encoding().to_string(),
    );
    resp.kind = BodyKind::Buffer;
    resp.body = Body::Bytes(compressed);
    Ok(())
}
