use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// Type of a single schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Char,
    Float,
    Double,
    IpAddr,
    Time,
    String,
    Bytes,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint8 => "uint8",
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Char => "char",
            Self::Float => "float",
            Self::Double => "double",
            Self::IpAddr => "ipaddr",
            Self::Time => "time",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "int8" => Self::Int8,
            "int16" => Self::Int16,
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "uint8" => Self::Uint8,
            "uint16" => Self::Uint16,
            "uint32" => Self::Uint32,
            "uint64" => Self::Uint64,
            "char" => Self::Char,
            "float" => Self::Float,
            "double" => Self::Double,
            "ipaddr" => Self::IpAddr,
            "time" => Self::Time,
            "string" => Self::String,
            "bytes" => Self::Bytes,
            other => return Err(TypeError::UnknownFieldType(other.to_string())),
        })
    }
}

/// One `type NAME` entry of a schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FieldSpec {
    pub ty: FieldType,
    pub name: String,
}

impl FieldSpec {
    fn parse(entry: &str) -> TypeResult<Self> {
        let mut parts = entry.split_whitespace();
        let (Some(ty), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(TypeError::InvalidSchema(format!(
                "expected \"type NAME\", got {entry:?}"
            )));
        };
        if !is_valid_name(name) {
            return Err(TypeError::InvalidSchema(format!("invalid field name {name:?}")));
        }
        Ok(Self {
            ty: ty.parse()?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ty, self.name)
    }
}

/// Field names follow `[A-Za-z][A-Za-z0-9_]*`.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ordered list of fields describing the records on one interface.
///
/// The engine treats a schema as metadata: it is negotiated per source and
/// the output schema is the union of everything seen. Textual form is a
/// comma-separated list such as `"time TIME_FIRST,time TIME_LAST,uint32 PACKETS"`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Parse a schema from its textual form.
    ///
    /// A field repeated with the same type is collapsed; a field repeated
    /// with a different type is an error.
    pub fn parse(spec: &str) -> TypeResult<Self> {
        let mut schema = Self::default();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            schema.insert(FieldSpec::parse(entry)?)?;
        }
        Ok(schema)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Merge `other` into this schema, appending fields not yet present.
    ///
    /// Returns `true` if any field was added. On a type conflict the schema
    /// is left unchanged.
    pub fn expand(&mut self, other: &Schema) -> TypeResult<bool> {
        for field in &other.fields {
            self.check_compatible(field)?;
        }
        let mut changed = false;
        for field in &other.fields {
            changed |= self.insert(field.clone())?;
        }
        Ok(changed)
    }

    fn check_compatible(&self, field: &FieldSpec) -> TypeResult<()> {
        match self.field(&field.name) {
            Some(existing) if existing.ty != field.ty => Err(TypeError::FieldConflict {
                name: field.name.clone(),
                existing: existing.ty.to_string(),
                incoming: field.ty.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, field: FieldSpec) -> TypeResult<bool> {
        self.check_compatible(&field)?;
        if self.field(&field.name).is_some() {
            return Ok(false);
        }
        self.fields.push(field);
        Ok(true)
    }

    /// Textual form, suitable for [`Schema::parse`].
    pub fn to_spec_string(&self) -> String {
        self.fields
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_spec_string())
    }
}

impl FromStr for Schema {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Schema {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Schema> for String {
    fn from(schema: Schema) -> Self {
        schema.to_spec_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render() {
        let schema = Schema::parse("time TIME_FIRST, time TIME_LAST,uint32 PACKETS").unwrap();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.to_spec_string(), "time TIME_FIRST,time TIME_LAST,uint32 PACKETS");
    }

    #[test]
    fn parse_rejects_unknown_type() {
        assert_eq!(
            Schema::parse("int128 BIG"),
            Err(TypeError::UnknownFieldType("int128".into()))
        );
    }

    #[test]
    fn parse_rejects_bad_names() {
        assert!(matches!(Schema::parse("uint8 9LIVES"), Err(TypeError::InvalidSchema(_))));
        assert!(matches!(Schema::parse("uint8"), Err(TypeError::InvalidSchema(_))));
        assert!(matches!(Schema::parse("uint8 A B"), Err(TypeError::InvalidSchema(_))));
    }

    #[test]
    fn duplicate_same_type_collapses() {
        let schema = Schema::parse("uint8 A,uint8 A").unwrap();
        assert_eq!(schema.len(), 1);
    }

    #[test]
    fn duplicate_different_type_conflicts() {
        assert!(matches!(
            Schema::parse("uint8 A,uint16 A"),
            Err(TypeError::FieldConflict { .. })
        ));
    }

    #[test]
    fn expand_appends_new_fields_in_order() {
        let mut out = Schema::parse("time TIME_FIRST,uint32 PACKETS").unwrap();
        let incoming = Schema::parse("uint32 PACKETS,uint64 BYTES,string URL").unwrap();
        assert!(out.expand(&incoming).unwrap());
        assert_eq!(
            out.to_spec_string(),
            "time TIME_FIRST,uint32 PACKETS,uint64 BYTES,string URL"
        );
        assert!(!out.expand(&incoming).unwrap());
    }

    #[test]
    fn expand_conflict_leaves_schema_untouched() {
        let mut out = Schema::parse("uint32 PACKETS").unwrap();
        let before = out.clone();
        let incoming = Schema::parse("uint64 BYTES,uint64 PACKETS").unwrap();
        assert!(out.expand(&incoming).is_err());
        assert_eq!(out, before);
    }

    #[test]
    fn serde_uses_spec_string() {
        let schema = Schema::parse("time TIME_LAST").unwrap();
        let json = serde_json::to_string(&schema).unwrap();
        assert_eq!(json, "\"time TIME_LAST\"");
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
        assert!(serde_json::from_str::<Schema>("\"bogus X\"").is_err());
    }
}
