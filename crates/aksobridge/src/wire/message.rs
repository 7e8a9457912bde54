//! Decoded messages and outbound frames.

use std::fmt;
use std::io;

use rmpv::{Utf8String, Value};

use super::tags;
use super::value::{FieldError, Fields};
use crate::session::{ApiMethod, ApiRequest, FieldAccess, UploadFile};

/// Requester-assigned id, echoed verbatim in the matching response.
///
/// Conventionally the raw bytes of a little-endian counter, so it is kept as
/// a raw MessagePack string and never required to be valid UTF-8.
#[derive(Clone)]
pub struct CorrelationId(Utf8String);

impl CorrelationId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    fn into_value(self) -> Value {
        Value::String(self.0)
    }
}

impl PartialEq for CorrelationId {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for CorrelationId {}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(Utf8String::from(s))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// One decoded inbound frame: `t`, `i`, and the rest of the map.
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: String,
    pub id: CorrelationId,
    pub fields: Fields,
}

impl Message {
    /// Validate the envelope of a decoded frame body.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Map(entries) = value else {
            return Err("expected object as root".to_string());
        };

        let mut tag = None;
        let mut id = None;
        for (k, v) in &entries {
            match k.as_str() {
                Some("t") => tag = Some(v),
                Some("i") => id = Some(v),
                _ => {}
            }
        }

        let tag = tag
            .and_then(Value::as_str)
            .ok_or_else(|| "expected t: string".to_string())?
            .to_string();
        let id = match id {
            Some(Value::String(s)) => CorrelationId(s.clone()),
            _ => return Err("expected i: string".to_string()),
        };

        Ok(Self {
            tag,
            id,
            fields: Fields::new(entries),
        })
    }
}

/// Every request type the dispatcher knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Handshake,
    Login,
    Logout,
    Totp,
    TotpRemove,
    Get,
    Delete,
    Post,
    Put,
    Patch,
    Perms,
    CodeholderFields,
    OwnCodeholderFields,
    Exit,
}

impl RequestKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "hi" => Self::Handshake,
            "login" => Self::Login,
            "logout" => Self::Logout,
            "totp" => Self::Totp,
            "-totp" => Self::TotpRemove,
            "get" => Self::Get,
            "delete" => Self::Delete,
            "post" => Self::Post,
            "put" => Self::Put,
            "patch" => Self::Patch,
            "perms" => Self::Perms,
            "permscf" => Self::CodeholderFields,
            "permsocf" => Self::OwnCodeholderFields,
            "x" => Self::Exit,
            _ => return None,
        })
    }
}

/// A request with its fields validated.
#[derive(Debug, Clone)]
pub enum Request {
    Handshake {
        ip: String,
        cookies: Vec<(String, String)>,
    },
    Login {
        login: String,
        password: String,
    },
    Logout,
    Totp {
        code: String,
        secret: Option<Vec<u8>>,
        remember: bool,
    },
    TotpRemove,
    Api(ApiRequest),
    Perms(Vec<String>),
    CodeholderFields(Vec<FieldAccess>),
    OwnCodeholderFields(Vec<FieldAccess>),
    Exit,
}

impl Request {
    pub fn parse(kind: RequestKind, fields: &Fields) -> Result<Self, FieldError> {
        Ok(match kind {
            RequestKind::Handshake => Self::Handshake {
                ip: fields.str("ip")?.to_string(),
                cookies: fields.string_map("co")?,
            },
            RequestKind::Login => Self::Login {
                login: fields.str("un")?.to_string(),
                password: fields.str("pw")?.to_string(),
            },
            RequestKind::Logout => Self::Logout,
            RequestKind::Totp => Self::Totp {
                code: fields.str("co")?.to_string(),
                secret: fields.opt_bytes("se")?,
                remember: fields.bool("r")?,
            },
            RequestKind::TotpRemove => Self::TotpRemove,
            RequestKind::Get => Self::Api(api_request(ApiMethod::Get, fields, false, false)?),
            RequestKind::Delete => {
                Self::Api(api_request(ApiMethod::Delete, fields, false, false)?)
            }
            RequestKind::Post => Self::Api(api_request(ApiMethod::Post, fields, true, true)?),
            RequestKind::Put => Self::Api(api_request(ApiMethod::Put, fields, true, true)?),
            RequestKind::Patch => Self::Api(api_request(ApiMethod::Patch, fields, true, false)?),
            RequestKind::Perms => Self::Perms(fields.string_list("p")?),
            RequestKind::CodeholderFields => Self::CodeholderFields(field_list(fields)?),
            RequestKind::OwnCodeholderFields => Self::OwnCodeholderFields(field_list(fields)?),
            RequestKind::Exit => Self::Exit,
        })
    }
}

fn api_request(
    method: ApiMethod,
    fields: &Fields,
    with_body: bool,
    with_files: bool,
) -> Result<ApiRequest, FieldError> {
    let body = if with_body {
        Some(fields.json("b")?).filter(|b| !b.is_null())
    } else {
        None
    };
    let files = if with_files {
        fields
            .files("f")?
            .into_iter()
            .map(|(name, content_type, data)| UploadFile {
                name,
                content_type,
                data,
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(ApiRequest {
        method,
        path: fields.str("p")?.to_string(),
        query: fields.json_object("q")?,
        body,
        files,
    })
}

fn field_list(fields: &Fields) -> Result<Vec<FieldAccess>, FieldError> {
    Ok(fields
        .string_list("f")?
        .iter()
        .map(|s| FieldAccess::parse(s))
        .collect())
}

/// Handler result fields, merged into the `~` frame next to `t` and `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply(Vec<(&'static str, Value)>);

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.0.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Every frame the server writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Success { id: CorrelationId, reply: Reply },
    Failure { id: CorrelationId, message: String },
    TransportError { code: u16, message: String },
    Heartbeat,
    Cookies(Vec<String>),
}

impl Outbound {
    /// Serialize as one MessagePack map.
    ///
    /// Strings that are not valid UTF-8 (correlation ids) keep the str
    /// family marker with their raw bytes.
    pub fn write_to(self, wr: &mut Vec<u8>) -> io::Result<()> {
        let entries = self.into_entries();
        rmp::encode::write_map_len(wr, entries.len() as u32).map_err(io::Error::other)?;
        for (key, value) in &entries {
            rmp::encode::write_str(wr, key).map_err(io::Error::other)?;
            write_entry_value(wr, value)?;
        }
        Ok(())
    }

    fn into_entries(self) -> Vec<(&'static str, Value)> {
        match self {
            Self::Success { id, reply } => {
                let mut entries = Vec::with_capacity(reply.0.len() + 2);
                entries.push(("t", Value::from(tags::SUCCESS)));
                entries.push(("i", id.into_value()));
                entries.extend(reply.0);
                entries
            }
            Self::Failure { id, message } => vec![
                ("t", Value::from(tags::FAILURE)),
                ("i", id.into_value()),
                ("m", Value::from(message)),
            ],
            Self::TransportError { code, message } => vec![
                ("t", Value::from(tags::TRANSPORT_ERROR)),
                ("c", Value::from(code)),
                ("m", Value::from(message)),
            ],
            Self::Heartbeat => vec![("t", Value::from(tags::HEARTBEAT))],
            Self::Cookies(cookies) => vec![
                ("t", Value::from(tags::COOKIES)),
                (
                    "co",
                    Value::Array(cookies.into_iter().map(Value::from).collect()),
                ),
            ],
        }
    }
}

fn write_entry_value(wr: &mut Vec<u8>, value: &Value) -> io::Result<()> {
    match value {
        // rmpv writes invalid UTF-8 strings as bin
        Value::String(s) if s.as_str().is_none() => {
            let bytes = s.as_bytes();
            rmp::encode::write_str_len(wr, bytes.len() as u32).map_err(io::Error::other)?;
            wr.extend_from_slice(bytes);
            Ok(())
        }
        other => rmpv::encode::write_value(wr, other).map_err(io::Error::other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        )
    }

    fn encode(frame: Outbound) -> Vec<u8> {
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn envelope_requires_string_tag_and_id() {
        let err = Message::from_value(Value::from("hi")).unwrap_err();
        assert_eq!(err, "expected object as root");

        let err = Message::from_value(map(vec![("i", Value::from("1"))])).unwrap_err();
        assert_eq!(err, "expected t: string");

        let err = Message::from_value(map(vec![
            ("t", Value::from("get")),
            ("i", Value::from(1u64)),
        ]))
        .unwrap_err();
        assert_eq!(err, "expected i: string");
    }

    #[test]
    fn non_utf8_id_is_kept_verbatim() {
        let raw = vec![0x80, 0x00, 0x00, 0x00];
        let id_value = rmpv::decode::read_value(&mut &[0xa4, 0x80, 0, 0, 0][..]).unwrap();
        let msg = Message::from_value(map(vec![("t", Value::from("x")), ("i", id_value)]))
            .unwrap();
        assert_eq!(msg.id.as_bytes(), &raw[..]);
        assert_eq!(msg.id.to_string(), "80000000");

        let buf = encode(Outbound::Success {
            id: msg.id,
            reply: Reply::new(),
        });
        // fixstr header followed by the raw id bytes, never bin
        assert!(buf.windows(5).any(|w| w == [0xa4, 0x80, 0, 0, 0]));
        assert!(!buf.contains(&0xc4));

        let decoded = rmpv::decode::read_value(&mut &buf[..]).unwrap();
        let id = decoded.as_map().unwrap()[1].1.clone();
        assert!(matches!(&id, Value::String(s) if s.as_bytes() == &raw[..]));
    }

    #[test]
    fn every_request_tag_is_known() {
        for tag in [
            "hi", "login", "logout", "totp", "-totp", "get", "delete", "post", "put", "patch",
            "perms", "permscf", "permsocf", "x",
        ] {
            assert!(RequestKind::from_tag(tag).is_some(), "{tag}");
        }
        assert_eq!(RequestKind::from_tag("-totp"), Some(RequestKind::TotpRemove));
        assert_eq!(RequestKind::from_tag("TXERR"), None);
        assert_eq!(RequestKind::from_tag("~"), None);
    }

    #[test]
    fn post_request_fields() {
        let msg = Message::from_value(map(vec![
            ("t", Value::from("post")),
            ("i", Value::from("\u{0}\u{0}\u{0}\u{0}")),
            ("p", Value::from("/codeholders")),
            ("b", map(vec![("name", Value::from("Zamenhof"))])),
            ("q", map(vec![("fields", Value::Array(vec![Value::from("id")]))])),
            ("f", map(vec![])),
        ]))
        .unwrap();

        let Request::Api(api) = Request::parse(RequestKind::Post, &msg.fields).unwrap() else {
            panic!("expected api request");
        };
        assert_eq!(api.method, ApiMethod::Post);
        assert_eq!(api.path, "/codeholders");
        assert_eq!(api.body, Some(serde_json::json!({"name": "Zamenhof"})));
        assert_eq!(api.query["fields"], serde_json::json!(["id"]));
        assert!(api.files.is_empty());
    }

    #[test]
    fn field_flags_split_on_first_dot() {
        let msg = Message::from_value(map(vec![
            ("t", Value::from("permscf")),
            ("i", Value::from("a")),
            (
                "f",
                Value::Array(vec![Value::from("email.r"), Value::from("address.rw")]),
            ),
        ]))
        .unwrap();

        let Request::CodeholderFields(fields) =
            Request::parse(RequestKind::CodeholderFields, &msg.fields).unwrap()
        else {
            panic!("expected field list");
        };
        assert_eq!(fields[0], FieldAccess::new("email", "r"));
        assert_eq!(fields[1], FieldAccess::new("address", "rw"));
    }

    #[test]
    fn mistyped_login_field_fails_parse() {
        let msg = Message::from_value(map(vec![
            ("t", Value::from("login")),
            ("i", Value::from("a")),
            ("un", Value::from("teeest")),
            ("pw", Value::from(true)),
        ]))
        .unwrap();
        let err = Request::parse(RequestKind::Login, &msg.fields).unwrap_err();
        assert_eq!(err.to_string(), "expected pw to be a string");
    }

    #[test]
    fn transport_error_shape() {
        let buf = encode(Outbound::TransportError {
            code: 400,
            message: "bad magic".to_string(),
        });
        let value = rmpv::decode::read_value(&mut &buf[..]).unwrap();
        assert_eq!(
            value,
            map(vec![
                ("t", Value::from("TXERR")),
                ("c", Value::from(400u16)),
                ("m", Value::from("bad magic")),
            ])
        );
    }
}
