//! Envelope codec: a fixed 128-byte textual header followed by the payload.
//!
//! The header reads `flag:<save|upd|load>,fileName:<name|null>,fileSize:<n|null>;`
//! and is padded with zero bytes up to [`HEADER_LEN`]. Anything after the
//! terminating `;` is padding and is never interpreted.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

/// Serialized header width in bytes.
pub const HEADER_LEN: usize = 128;

/// Header value standing for an absent field.
pub const NULL: &str = "null";
const FILE_NAME_KEY: &str = ",fileName:";
const FILE_SIZE_KEY: &str = ",fileSize:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Upload a file to the server.
    Save,
    /// Table sync request, or the table snapshot sent back.
    Update,
    /// Download request, or one requested file sent back.
    Load,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Save => "save",
            Flag::Update => "upd",
            Flag::Load => "load",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "save" => Ok(Flag::Save),
            "upd" => Ok(Flag::Update),
            "load" => Ok(Flag::Load),
            other => Err(Error::MalformedHeader(format!("unknown flag {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flag: Flag,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

/// Render a header into its fixed-width slot.
///
/// Fails with [`Error::Encoding`] instead of truncating when the rendered
/// fields do not fit.
pub fn encode_header(
    flag: Flag,
    file_name: Option<&str>,
    file_size: Option<u64>,
) -> Result<[u8; HEADER_LEN]> {
    let size = file_size.map(|s| s.to_string());
    let text = format!(
        "flag:{}{}{}{}{};",
        flag,
        FILE_NAME_KEY,
        file_name.unwrap_or(NULL),
        FILE_SIZE_KEY,
        size.as_deref().unwrap_or(NULL)
    );
    if text.len() > HEADER_LEN {
        return Err(Error::Encoding {
            len: text.len(),
            max: HEADER_LEN,
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header[..text.len()].copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse the first [`HEADER_LEN`] bytes of `bytes` as a header.
///
/// File names may themselves contain `,`, `:` or `;`, so the size field is
/// located by its shape (`,fileSize:` + digits or `null` + `;`) rather than by
/// splitting on delimiters. A name may even contain that shape, so the field
/// whose `;` is followed only by zero padding wins; headers padded with other
/// bytes fall back to the first well-formed field.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_LEN {
        return Err(malformed(format!(
            "expected {} header bytes, got {}",
            HEADER_LEN,
            bytes.len()
        )));
    }
    let text = String::from_utf8_lossy(&bytes[..HEADER_LEN]);

    let rest = text
        .strip_prefix("flag:")
        .ok_or_else(|| malformed("missing flag key"))?;
    let flag_end = rest
        .find([',', ';'])
        .ok_or_else(|| malformed("unterminated flag"))?;
    let flag: Flag = rest[..flag_end].parse()?;
    let rest = &rest[flag_end..];

    if rest.starts_with(';') {
        return Ok(Header {
            flag,
            file_name: None,
            file_size: None,
        });
    }

    let fields = rest
        .strip_prefix(FILE_NAME_KEY)
        .ok_or_else(|| malformed("missing fileName key"))?;
    let candidates: Vec<(&str, Option<u64>, bool)> = fields
        .match_indices(FILE_SIZE_KEY)
        .filter_map(|(at, key)| {
            let tail = &fields[at + key.len()..];
            let end = tail.find(';')?;
            let size = parse_size(&tail[..end])?;
            let zero_padded = tail[end + 1..].bytes().all(|b| b == 0);
            Some((&fields[..at], size, zero_padded))
        })
        .collect();
    let (name, size, _) = candidates
        .iter()
        .rev()
        .find(|(_, _, zero_padded)| *zero_padded)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| malformed("missing or invalid fileSize field"))?;

    Ok(Header {
        flag,
        file_name: (name != NULL).then(|| name.to_string()),
        file_size: size,
    })
}

fn parse_size(value: &str) -> Option<Option<u64>> {
    if value == NULL {
        return Some(None);
    }
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok().map(Some)
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedHeader(reason.into())
}

/// Check that `name` names a single entry inside a directory.
pub fn check_file_name(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain || name.contains(['/', '\\']) {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    Ok(name)
}

/// One application message: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(flag: Flag, file_name: Option<String>, file_size: Option<u64>, payload: Bytes) -> Self {
        Self {
            header: Header {
                flag,
                file_name,
                file_size,
            },
            payload,
        }
    }

    /// An upload of `data` under `file_name`.
    pub fn save(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(Flag::Save, Some(file_name.into()), Some(size), data)
    }

    pub fn update_request() -> Self {
        Self::new(Flag::Update, None, None, Bytes::new())
    }

    /// A table snapshot sent by the server.
    pub fn update(snapshot: impl Into<Bytes>) -> Self {
        Self::new(Flag::Update, None, None, snapshot.into())
    }

    /// A download request; names are joined by newlines in the given order.
    pub fn load_request<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut payload = String::new();
        for name in names {
            payload.push_str(name.as_ref());
            payload.push('\n');
        }
        Self::new(Flag::Load, None, None, Bytes::from(payload))
    }

    /// One requested file sent back by the server.
    pub fn load(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(Flag::Load, Some(file_name.into()), Some(size), data)
    }

    pub fn flag(&self) -> Flag {
        self.header.flag
    }

    pub fn file_name(&self) -> Option<&str> {
        self.header.file_name.as_deref()
    }

    /// Payload bytes, limited to the declared size when there is one.
    pub fn body(&self) -> &[u8] {
        match self.header.file_size {
            Some(size) => {
                let size = usize::try_from(size).unwrap_or(usize::MAX);
                &self.payload[..size.min(self.payload.len())]
            }
            None => &self.payload,
        }
    }

    /// Names carried by a download request, blank lines skipped.
    pub fn requested_names(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.payload)
            .split('\n')
            .map(|name| name.trim_end_matches('\r'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Header slot followed by the payload, ready to be framed.
    pub fn encode(&self) -> Result<Bytes> {
        let header = encode_header(
            self.header.flag,
            self.header.file_name.as_deref(),
            self.header.file_size,
        )?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode the content of one frame.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        let header = decode_header(&frame)?;
        let payload = frame.split_off(HEADER_LEN);
        Ok(Self { header, payload })
    }
}
