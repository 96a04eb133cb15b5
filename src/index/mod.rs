// Index storage, schema and the declaration model

pub mod db;
pub mod schema;
pub mod staleness;

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Disk modification time of `path` in milliseconds since the Unix epoch
pub fn last_modified_millis(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0))
}

/// Per-file bookkeeping stored in the files partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub package_fq_name: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: i64,
    /// In-memory edit counter, 0 until the editor touches the file
    pub modification_stamp: u64,
    pub indexed: bool,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, package_fq_name: impl Into<String>, last_modified: i64, modification_stamp: u64) -> Self {
        Self {
            path: path.into(),
            package_fq_name: package_fq_name.into(),
            last_modified,
            modification_stamp,
            indexed: false,
        }
    }

    pub fn into_indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Byte offsets of a declaration within its file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Class-like declaration flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassKind {
    Class,
    AbstractClass,
    Interface,
    EnumClass,
    Object,
    AnnotationClass,
}

impl ClassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKind::Class => "class",
            ClassKind::AbstractClass => "abstract class",
            ClassKind::Interface => "interface",
            ClassKind::EnumClass => "enum class",
            ClassKind::Object => "object",
            ClassKind::AnnotationClass => "annotation class",
        }
    }
}

/// A function parameter with its rendered type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_: String,
}

/// A named, located declaration extracted from a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub fq_name: String,
    pub file: String,
    pub span: Span,
    pub kind: DeclarationKind,
}

/// Kind-specific payload of a declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclarationKind {
    Class {
        class_kind: ClassKind,
    },
    Function {
        parameters: Vec<Parameter>,
        return_type: String,
        /// Empty for top-level functions
        enclosing_type: String,
        /// Empty unless this is an extension function
        receiver_type: String,
    },
    Field {
        type_: String,
        enclosing_type: String,
    },
    EnumEntry {
        enum_fq_name: String,
    },
}

impl Declaration {
    pub fn kind_str(&self) -> &'static str {
        match &self.kind {
            DeclarationKind::Class { class_kind } => class_kind.as_str(),
            DeclarationKind::Function { .. } => "function",
            DeclarationKind::Field { .. } => "field",
            DeclarationKind::EnumEntry { .. } => "enum entry",
        }
    }

    /// Type a completion candidate must be qualified with, if any.
    ///
    /// Extension functions answer with their receiver, members with their
    /// enclosing type. `None` means the declaration matches any owner filter.
    pub fn owner_type(&self) -> Option<&str> {
        let owner = match &self.kind {
            DeclarationKind::Class { .. } => "",
            DeclarationKind::Function {
                enclosing_type,
                receiver_type,
                ..
            } => {
                if receiver_type.is_empty() {
                    enclosing_type
                } else {
                    receiver_type
                }
            }
            DeclarationKind::Field { enclosing_type, .. } => enclosing_type,
            DeclarationKind::EnumEntry { enum_fq_name } => enum_fq_name,
        };
        if owner.is_empty() {
            None
        } else {
            Some(owner)
        }
    }

    /// Human readable one-line rendering, used as completion detail
    pub fn signature(&self) -> String {
        match &self.kind {
            DeclarationKind::Class { class_kind } => format!("{} {}", class_kind.as_str(), self.name),
            DeclarationKind::Function {
                parameters,
                return_type,
                receiver_type,
                ..
            } => {
                let params = parameters
                    .iter()
                    .map(|p| format!("{}: {}", p.name, p.type_))
                    .collect::<Vec<_>>()
                    .join(", ");
                let receiver = if receiver_type.is_empty() {
                    String::new()
                } else {
                    format!("{}.", receiver_type)
                };
                if return_type.is_empty() {
                    format!("fun {}{}({})", receiver, self.name, params)
                } else {
                    format!("fun {}{}({}): {}", receiver, self.name, params, return_type)
                }
            }
            DeclarationKind::Field { type_, .. } => {
                if type_.is_empty() {
                    format!("val {}", self.name)
                } else {
                    format!("val {}: {}", self.name, type_)
                }
            }
            DeclarationKind::EnumEntry { enum_fq_name } => format!("{}.{}", enum_fq_name, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(enclosing: &str, receiver: &str) -> Declaration {
        Declaration {
            name: "run".to_string(),
            fq_name: "demo.run".to_string(),
            file: "/p/Main.kt".to_string(),
            span: Span::new(0, 10),
            kind: DeclarationKind::Function {
                parameters: vec![Parameter {
                    name: "times".to_string(),
                    type_: "Int".to_string(),
                }],
                return_type: "Unit".to_string(),
                enclosing_type: enclosing.to_string(),
                receiver_type: receiver.to_string(),
            },
        }
    }

    #[test]
    fn test_owner_type_prefers_receiver() {
        assert_eq!(function("", "").owner_type(), None);
        assert_eq!(function("demo.Bar", "").owner_type(), Some("demo.Bar"));
        assert_eq!(function("demo.Bar", "String").owner_type(), Some("String"));
    }

    #[test]
    fn test_signature_rendering() {
        assert_eq!(function("", "String").signature(), "fun String.run(times: Int): Unit");

        let class = Declaration {
            name: "Bar".to_string(),
            fq_name: "demo.Bar".to_string(),
            file: "/p/Main.kt".to_string(),
            span: Span::default(),
            kind: DeclarationKind::Class {
                class_kind: ClassKind::EnumClass,
            },
        };
        assert_eq!(class.signature(), "enum class Bar");
        assert_eq!(class.owner_type(), None);
    }

    #[test]
    fn test_declaration_json_is_tagged() {
        let value = serde_json::to_value(function("", "")).unwrap();
        assert_eq!(value["kind"]["kind"], "function");
        let back: Declaration = serde_json::from_value(value).unwrap();
        assert_eq!(back, function("", ""));
    }
}
