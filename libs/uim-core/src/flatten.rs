//! Placement-driven flattening of request objects into HTTP parameters.
//!
//! A request type lists its fields once through [`Flatten::fields`]; each
//! field names its wire key, where it goes ([`Placement`]) and its shape
//! ([`Param`]). [`flatten`] walks that table recursively and produces the
//! header, query, path and form maps of a request.
//!
//! Key layout:
//!
//! | shape     | key                                   |
//! |-----------|---------------------------------------|
//! | scalar    | `name`                                |
//! | struct    | `name.child`                          |
//! | repeated  | `name.1`, `name.2`, ... (`name.1.child`) |
//! | map       | `name.#<key byte length>#<key>`       |
//! | json      | `name` (whole value as one JSON blob) |
//!
//! Empty values are never materialized and absent collections are skipped.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::UimError;

/// Where a flattened parameter lands in the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
    Header,
    Query,
    Path,
    /// URL-encoded form body
    Body,
}

impl Placement {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Query => "query",
            Self::Path => "path",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Placement {
    type Err = UimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "header" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            "path" => Ok(Self::Path),
            "body" => Ok(Self::Body),
            other => Err(UimError::unsupported_param_position(other)),
        }
    }
}

/// Field shape, as reported by [`Param::shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Struct,
    Map,
    Repeated,
    Json,
}

/// Anything that serializes to a JSON string.
///
/// Implemented for every `Serialize` type; exists so field tables can hold
/// heterogeneous values behind `&dyn JsonBlob`.
pub trait JsonBlob {
    /// # Errors
    ///
    /// Returns the serializer error unchanged.
    fn to_json(&self) -> serde_json::Result<String>;
}

impl<T: Serialize + ?Sized> JsonBlob for T {
    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A field value together with its shape.
pub enum Param<'a> {
    /// Plain string value
    Scalar(Cow<'a, str>),
    /// Scalar slot holding a map: encoded as a JSON string, with `null`
    /// becoming the empty string (and therefore dropped)
    Encoded(&'a dyn JsonBlob),
    /// Nested object; `None` is skipped
    Struct(Option<&'a dyn Flatten>),
    /// Ordered list; `None` is skipped
    Repeated(Option<Vec<Param<'a>>>),
    /// Keyed entries; `None` is skipped
    Map(Option<Vec<(Cow<'a, str>, Param<'a>)>>),
    /// Whole value serialized as one JSON blob
    Json(&'a dyn JsonBlob),
}

impl<'a> Param<'a> {
    /// Borrowed string scalar.
    #[must_use]
    pub fn text(value: &'a str) -> Self {
        Self::Scalar(Cow::Borrowed(value))
    }

    /// Scalar rendered through `Display` (numbers, booleans, enums).
    #[must_use]
    pub fn display(value: impl fmt::Display) -> Self {
        Self::Scalar(Cow::Owned(value.to_string()))
    }

    /// Optional scalar; `None` flattens to nothing.
    #[must_use]
    pub fn optional<T: fmt::Display + ?Sized>(value: Option<&T>) -> Self {
        Self::Scalar(value.map_or(Cow::Borrowed(""), |v| Cow::Owned(v.to_string())))
    }

    #[must_use]
    pub fn nested<T: Flatten>(value: Option<&'a T>) -> Self {
        Self::Struct(value.map(|v| v as &dyn Flatten))
    }

    #[must_use]
    pub fn list<I>(items: Option<I>) -> Self
    where
        I: IntoIterator<Item = Param<'a>>,
    {
        Self::Repeated(items.map(|items| items.into_iter().collect()))
    }

    #[must_use]
    pub fn entries<I>(entries: Option<I>) -> Self
    where
        I: IntoIterator<Item = (&'a str, Param<'a>)>,
    {
        Self::Map(entries.map(|entries| {
            entries
                .into_iter()
                .map(|(k, v)| (Cow::Borrowed(k), v))
                .collect()
        }))
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Scalar(_) | Self::Encoded(_) => Shape::Scalar,
            Self::Struct(_) => Shape::Struct,
            Self::Repeated(_) => Shape::Repeated,
            Self::Map(_) => Shape::Map,
            Self::Json(_) => Shape::Json,
        }
    }
}

impl fmt::Debug for Param<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::Encoded(_) => f.write_str("Encoded(..)"),
            Self::Struct(v) => f.debug_tuple("Struct").field(&v.is_some()).finish(),
            Self::Repeated(v) => f.debug_tuple("Repeated").field(v).finish(),
            Self::Map(v) => f.debug_tuple("Map").field(v).finish(),
            Self::Json(_) => f.write_str("Json(..)"),
        }
    }
}

/// One entry of a field table.
#[derive(Debug)]
pub struct Field<'a> {
    /// Wire key
    pub name: &'static str,
    /// `None` inherits the enclosing field's placement; a top-level field
    /// without a placement cannot carry a value.
    pub placement: Option<Placement>,
    pub value: Param<'a>,
}

impl<'a> Field<'a> {
    #[must_use]
    pub fn new(name: &'static str, placement: Placement, value: Param<'a>) -> Self {
        Self {
            name,
            placement: Some(placement),
            value,
        }
    }

    /// Field of a nested object, placed wherever its parent is placed.
    #[must_use]
    pub fn inherit(name: &'static str, value: Param<'a>) -> Self {
        Self {
            name,
            placement: None,
            value,
        }
    }
}

/// Compile-time field table of a request object.
pub trait Flatten {
    fn fields(&self) -> Vec<Field<'_>>;
}

/// Placement-addressed parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub path: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
}

impl Params {
    /// Insert a non-empty value; empty values are dropped. Header names are
    /// stored lowercase.
    pub fn insert(
        &mut self,
        placement: Placement,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        let mut key = key.into();
        let map = match placement {
            Placement::Header => {
                key.make_ascii_lowercase();
                &mut self.headers
            }
            Placement::Query => &mut self.query,
            Placement::Path => &mut self.path,
            Placement::Body => &mut self.form,
        };
        map.insert(key, value);
    }

    /// Insert by string placement tag.
    ///
    /// # Errors
    ///
    /// Returns `SDK.UnsupportedParamPosition` for an unknown tag carrying a
    /// non-empty value. Empty values are dropped before the tag is checked.
    pub fn insert_tagged(
        &mut self,
        tag: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), UimError> {
        let value = value.into();
        if value.is_empty() {
            return Ok(());
        }
        let placement = tag.parse::<Placement>()?;
        self.insert(placement, key, value);
        Ok(())
    }

    /// Fold `other` into `self`; keys of `other` win.
    pub fn merge(&mut self, other: Params) {
        self.headers.extend(other.headers);
        self.query.extend(other.query);
        self.path.extend(other.path);
        self.form.extend(other.form);
    }
}

/// Flatten `object` into placement-addressed parameters.
///
/// # Errors
///
/// - `SDK.UnsupportedParamPosition` when a non-empty value has no placement
/// - `SDK.JsonMarshalError` when an encoded or JSON field fails to serialize
pub fn flatten(object: &dyn Flatten) -> Result<Params, UimError> {
    let mut params = Params::default();
    flatten_into(&mut params, object, None, "")?;
    Ok(params)
}

fn flatten_into(
    params: &mut Params,
    object: &dyn Flatten,
    inherited: Option<Placement>,
    prefix: &str,
) -> Result<(), UimError> {
    for field in object.fields() {
        let placement = inherited.or(field.placement);
        let key = format!("{prefix}{}", field.name);
        visit(params, placement, key, &field.value)?;
    }
    Ok(())
}

fn visit(
    params: &mut Params,
    placement: Option<Placement>,
    key: String,
    value: &Param<'_>,
) -> Result<(), UimError> {
    match value {
        Param::Scalar(v) => add(params, placement, key, v),
        Param::Encoded(blob) => {
            let encoded = blob.to_json().map_err(UimError::json_marshal)?;
            if encoded == "null" {
                return Ok(());
            }
            add(params, placement, key, &encoded)
        }
        Param::Json(blob) => {
            let encoded = blob.to_json().map_err(UimError::json_marshal)?;
            add(params, placement, key, &encoded)
        }
        Param::Struct(None) | Param::Repeated(None) | Param::Map(None) => Ok(()),
        Param::Struct(Some(inner)) => flatten_into(params, *inner, placement, &format!("{key}.")),
        Param::Repeated(Some(items)) => {
            for (index, item) in items.iter().enumerate() {
                visit(params, placement, format!("{key}.{}", index + 1), item)?;
            }
            Ok(())
        }
        Param::Map(Some(entries)) => {
            for (entry_key, item) in entries {
                let composite = format!("{key}.#{}#{entry_key}", entry_key.len());
                visit(params, placement, composite, item)?;
            }
            Ok(())
        }
    }
}

fn add(
    params: &mut Params,
    placement: Option<Placement>,
    key: String,
    value: &str,
) -> Result<(), UimError> {
    if value.is_empty() {
        return Ok(());
    }
    let Some(placement) = placement else {
        return Err(UimError::unsupported_param_position(""));
    };
    params.insert(placement, key, value);
    Ok(())
}
