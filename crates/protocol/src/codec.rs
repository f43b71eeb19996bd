//! JSON codec for bus payloads.
//!
//! Conventions shared by every message:
//! - field names are lowerCamelCase on the wire; on input they match
//!   ASCII case-insensitively, so `Url`, `URL` and `url` are the same field;
//! - enums travel as their string tag (never the ordinal) and parse
//!   case-insensitively; an unknown tag is a decode error naming the value;
//! - optional fields may be absent and decode to `None`/defaults.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::de::value::StringDeserializer;
use serde::de::{DeserializeOwned, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown {kind} `{value}`")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("invalid HTTP method `{0}`")]
    InvalidMethod(String),
}

/// Serializes a payload to its wire bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserializes a payload from its wire bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    from_value(serde_json::from_slice(bytes)?)
}

/// Deserializes a payload from an already parsed JSON value.
///
/// Struct field names match case-insensitively at every nesting level.
/// Map keys of non-struct types (header names) are left as sent.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
    Ok(T::deserialize(CaseFolded(value))?)
}

/// A JSON value whose object keys are matched against struct fields
/// ignoring ASCII case.
struct CaseFolded(Value);

impl<'de> Deserializer<'de> for CaseFolded {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        self.0.deserialize_any(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            value => visitor.visit_some(CaseFolded(value)),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(FoldedSeq(items.into_iter())),
            value => value.deserialize_seq(visitor),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.0 {
            Value::Object(map) => visitor.visit_map(FoldedMap {
                entries: map.into_iter(),
                fields,
                pending: None,
            }),
            value => value.deserialize_struct(name, fields, visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct tuple tuple_struct map identifier
        ignored_any
    }
}

struct FoldedSeq(std::vec::IntoIter<Value>);

impl<'de> SeqAccess<'de> for FoldedSeq {
    type Error = serde_json::Error;

    fn next_element_seed<S: DeserializeSeed<'de>>(
        &mut self,
        seed: S,
    ) -> Result<Option<S::Value>, Self::Error> {
        self.0
            .next()
            .map(|item| seed.deserialize(CaseFolded(item)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

struct FoldedMap {
    entries: serde_json::map::IntoIter,
    fields: &'static [&'static str],
    pending: Option<Value>,
}

impl<'de> MapAccess<'de> for FoldedMap {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        let Some((key, value)) = self.entries.next() else {
            return Ok(None);
        };
        self.pending = Some(value);
        let key = match self.fields.iter().find(|f| f.eq_ignore_ascii_case(&key)) {
            Some(field) => (*field).to_string(),
            None => key,
        };
        seed.deserialize(StringDeserializer::<serde_json::Error>::new(key))
            .map(Some)
    }

    fn next_value_seed<S: DeserializeSeed<'de>>(
        &mut self,
        seed: S,
    ) -> Result<S::Value, Self::Error> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| <serde_json::Error as serde::de::Error>::custom("value is missing"))?;
        seed.deserialize(CaseFolded(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Declares a string-tagged wire enum.
///
/// Generates `as_str`, `Display`, a case-insensitive `FromStr` that fails
/// with [`CodecError::UnknownVariant`], and serde impls built on those.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $tag:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Returns the wire tag.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $tag ),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::codec::CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($tag) {
                        return Ok(Self::$variant);
                    }
                )+
                Err($crate::codec::CodecError::UnknownVariant {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                raw.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use wire_enum;

/// An HTTP request method in its canonical uppercase form.
///
/// Standard verbs are available as constants; extension methods are
/// accepted as long as they are valid RFC 7230 tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpMethod(Cow<'static, str>);

impl HttpMethod {
    pub const GET: HttpMethod = HttpMethod(Cow::Borrowed("GET"));
    pub const HEAD: HttpMethod = HttpMethod(Cow::Borrowed("HEAD"));
    pub const POST: HttpMethod = HttpMethod(Cow::Borrowed("POST"));
    pub const PUT: HttpMethod = HttpMethod(Cow::Borrowed("PUT"));
    pub const PATCH: HttpMethod = HttpMethod(Cow::Borrowed("PATCH"));
    pub const DELETE: HttpMethod = HttpMethod(Cow::Borrowed("DELETE"));
    pub const OPTIONS: HttpMethod = HttpMethod(Cow::Borrowed("OPTIONS"));
    pub const TRACE: HttpMethod = HttpMethod(Cow::Borrowed("TRACE"));
    pub const CONNECT: HttpMethod = HttpMethod(Cow::Borrowed("CONNECT"));

    /// Parses a method, normalizing it to uppercase.
    pub fn new(raw: &str) -> Result<Self, CodecError> {
        let valid = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
        if !valid {
            return Err(CodecError::InvalidMethod(raw.to_string()));
        }
        Ok(Self(Cow::Owned(raw.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_head(&self) -> bool {
        self.as_str() == "HEAD"
    }
}

impl Default for HttpMethod {
    fn default() -> Self {
        Self::GET
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for HttpMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        HttpMethod::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter storing a [`std::time::Duration`] as integer milliseconds.
///
/// Zero and negative values decode to [`Duration::ZERO`](std::time::Duration::ZERO);
/// callers coerce that to their own default.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(u64::try_from(millis)
            .map(Duration::from_millis)
            .unwrap_or(Duration::ZERO))
    }
}
