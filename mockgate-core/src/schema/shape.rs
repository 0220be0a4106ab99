//! Service and method descriptors built from reflected file descriptors.
//!
//! The reflected files are loaded into a [`DescriptorPool`]; every method
//! keeps its input and output [`MessageDescriptor`], which carry the pool
//! with them. [`FieldShape`] is a structural view of one field, used where
//! code walks a message type field by field (previews and JSON fix-ups).

use prost_reflect::{
    DescriptorPool, EnumDescriptor, FieldDescriptor, Kind, MessageDescriptor,
};
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use std::fmt;
use std::sync::Arc;

use super::SchemaError;

/// Protobuf scalar kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
}

impl ScalarKind {
    fn from_kind(kind: &Kind) -> Option<Self> {
        Some(match kind {
            Kind::Double => Self::Double,
            Kind::Float => Self::Float,
            Kind::Int32 => Self::Int32,
            Kind::Int64 => Self::Int64,
            Kind::Uint32 => Self::Uint32,
            Kind::Uint64 => Self::Uint64,
            Kind::Sint32 => Self::Sint32,
            Kind::Sint64 => Self::Sint64,
            Kind::Fixed32 => Self::Fixed32,
            Kind::Fixed64 => Self::Fixed64,
            Kind::Sfixed32 => Self::Sfixed32,
            Kind::Sfixed64 => Self::Sfixed64,
            Kind::Bool => Self::Bool,
            Kind::String => Self::String,
            Kind::Bytes => Self::Bytes,
            Kind::Message(_) | Kind::Enum(_) => return None,
        })
    }

    /// 64-bit integers travel as JSON strings.
    pub fn is_64_bit(self) -> bool {
        matches!(
            self,
            Self::Int64 | Self::Uint64 | Self::Sint64 | Self::Fixed64 | Self::Sfixed64
        )
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            Self::Double | Self::Float | Self::Bool | Self::String | Self::Bytes
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::Float => "float",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Sint32 => "sint32",
            Self::Sint64 => "sint64",
            Self::Fixed32 => "fixed32",
            Self::Fixed64 => "fixed64",
            Self::Sfixed32 => "sfixed32",
            Self::Sfixed64 => "sfixed64",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of field shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    Scalar(ScalarKind),
    Enum(EnumDescriptor),
    Message(MessageDescriptor),
    Repeated(Box<FieldShape>),
    Map(ScalarKind, Box<FieldShape>),
}

impl FieldShape {
    pub fn of(field: &FieldDescriptor) -> Self {
        if field.is_map()
            && let Kind::Message(entry) = field.kind()
        {
            let key = ScalarKind::from_kind(&entry.map_entry_key_field().kind())
                .unwrap_or(ScalarKind::String);
            let value = Self::element(&entry.map_entry_value_field().kind());
            return Self::Map(key, Box::new(value));
        }
        let element = Self::element(&field.kind());
        if field.is_list() {
            Self::Repeated(Box::new(element))
        } else {
            element
        }
    }

    fn element(kind: &Kind) -> Self {
        match kind {
            Kind::Message(message) => Self::Message(message.clone()),
            Kind::Enum(e) => Self::Enum(e.clone()),
            scalar => ScalarKind::from_kind(scalar)
                .map(Self::Scalar)
                .unwrap_or(Self::Scalar(ScalarKind::Bytes)),
        }
    }

    /// Short human-readable form, used in method previews.
    pub fn describe(&self) -> String {
        match self {
            Self::Scalar(kind) => kind.name().to_string(),
            Self::Enum(e) => e.full_name().to_string(),
            Self::Message(m) => m.full_name().to_string(),
            Self::Repeated(elem) => format!("repeated {}", elem.describe()),
            Self::Map(key, value) => format!("map<{}, {}>", key, value.describe()),
        }
    }
}

/// A resolved RPC method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    /// `/package.Service/Method`
    pub full_name: String,
    pub name: String,
    pub service: String,
    pub input: MessageDescriptor,
    pub output: MessageDescriptor,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// A resolved service with its methods.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<Arc<MethodDescriptor>>,
}

/// Load `files` into a fresh pool and describe every service in it.
///
/// Files may arrive in any order but must be closed over their imports.
/// `skip_service` filters out services by full name.
pub fn build_services(
    files: &[FileDescriptorProto],
    skip_service: impl Fn(&str) -> bool,
) -> Result<Vec<ServiceDescriptor>, SchemaError> {
    let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
        file: files.to_vec(),
    })?;

    let mut services: Vec<ServiceDescriptor> = pool
        .services()
        .filter(|service| !skip_service(service.full_name()))
        .map(|service| ServiceDescriptor {
            name: service.full_name().to_string(),
            methods: service
                .methods()
                .map(|method| {
                    Arc::new(MethodDescriptor {
                        full_name: format!("/{}/{}", service.full_name(), method.name()),
                        name: method.name().to_string(),
                        service: service.full_name().to_string(),
                        input: method.input(),
                        output: method.output(),
                        client_streaming: method.is_client_streaming(),
                        server_streaming: method.is_server_streaming(),
                    })
                })
                .collect(),
        })
        .collect();

    services.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(services)
}
