//! Proto source regeneration.
//!
//! Turns resolved contracts back into `.proto` text: one file per declaring file and per
//! transitive dependency. Only the requested services are emitted. Files under
//! `google/protobuf/` are imported, never regenerated, because every compiler ships them.
use super::SynthesisError;
use crate::catalog::ContractDescription;
use prost_reflect::FileDescriptor;
use prost_types::{
    DescriptorProto, EnumDescriptorProto, FieldDescriptorProto, FileDescriptorProto,
    MethodDescriptorProto, ServiceDescriptorProto,
    field_descriptor_proto::{Label, Type},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Write},
};

const WELL_KNOWN_PREFIX: &str = "google/protobuf/";
const MAX_FIELD_NUMBER: i32 = 536_870_911;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Emit streaming operations. When disabled they are dropped with a warning.
    pub async_variants: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            async_variants: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationWarning {
    pub fatal: bool,
    pub message: String,
}

impl GenerationWarning {
    fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            message: message.into(),
        }
    }

    fn minor(message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for GenerationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.fatal { "error" } else { "warning" };
        write!(f, "{level}: {}", self.message)
    }
}

/// Proto source text ready to be compiled.
#[derive(Debug, Clone, Default)]
pub struct GeneratedSource {
    pub(crate) files: BTreeMap<String, String>,
    pub(crate) roots: Vec<String>,
    pub(crate) warnings: Vec<GenerationWarning>,
}

impl GeneratedSource {
    /// Source text keyed by file name.
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// The files declaring the requested contracts.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn warnings(&self) -> &[GenerationWarning] {
        &self.warnings
    }
}

/// Regenerates proto source for `contracts`.
pub fn generate(
    contracts: &[ContractDescription],
    options: &GenerateOptions,
) -> Result<GeneratedSource, SynthesisError> {
    let mut requested: HashMap<String, HashSet<String>> = HashMap::new();
    let mut roots = Vec::new();

    for contract in contracts {
        let file = contract.service().parent_file();
        let name = file.name().to_string();
        if !requested.contains_key(&name) {
            roots.push(name.clone());
        }
        requested
            .entry(name)
            .or_default()
            .insert(contract.service().name().to_string());
    }

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    for contract in contracts {
        collect_files(contract.service().parent_file(), &mut seen, &mut files);
    }

    let mut source = GeneratedSource {
        roots,
        ..Default::default()
    };

    for file in files {
        let services = requested.get(file.name()).cloned().unwrap_or_default();
        let mut printer = Printer::new(options, &mut source.warnings);
        printer.file(file.file_descriptor_proto(), &services);
        source.files.insert(file.name().to_string(), printer.out);
    }

    if source.warnings.iter().any(|w| w.fatal) {
        for warning in &source.warnings {
            tracing::error!(%warning, "code generation failed");
        }
        return Err(SynthesisError::CodeGeneration {
            warnings: source.warnings,
        });
    }

    for warning in &source.warnings {
        tracing::warn!(%warning, "code generation warning");
    }

    Ok(source)
}

/// Dependencies first, so the output reads in import order.
fn collect_files(file: FileDescriptor, seen: &mut HashSet<String>, out: &mut Vec<FileDescriptor>) {
    if file.name().starts_with(WELL_KNOWN_PREFIX) || !seen.insert(file.name().to_string()) {
        return;
    }
    for dependency in file.dependencies() {
        collect_files(dependency, seen, out);
    }
    out.push(file);
}

struct Printer<'a> {
    out: String,
    indent: usize,
    proto2: bool,
    file: String,
    options: &'a GenerateOptions,
    warnings: &'a mut Vec<GenerationWarning>,
}

impl<'a> Printer<'a> {
    fn new(options: &'a GenerateOptions, warnings: &'a mut Vec<GenerationWarning>) -> Self {
        Self {
            out: String::new(),
            indent: 0,
            proto2: false,
            file: String::new(),
            options,
            warnings,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.indent {
            self.out.push_str("  ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn file(&mut self, file: &FileDescriptorProto, services: &HashSet<String>) {
        self.file = file.name().to_string();

        match file.syntax() {
            "" | "proto2" => self.proto2 = true,
            "proto3" => self.proto2 = false,
            other => {
                let message = format!("{}: unsupported syntax '{other}'", self.file);
                self.warnings.push(GenerationWarning::fatal(message));
                return;
            }
        }

        self.line(format!(
            "syntax = \"{}\";",
            if self.proto2 { "proto2" } else { "proto3" }
        ));
        if !file.package().is_empty() {
            self.out.push('\n');
            self.line(format!("package {};", file.package()));
        }

        if !file.dependency.is_empty() {
            self.out.push('\n');
        }
        for (i, dependency) in file.dependency.iter().enumerate() {
            let public = i32::try_from(i).is_ok_and(|i| file.public_dependency.contains(&i));
            let modifier = if public { "public " } else { "" };
            self.line(format!("import {modifier}{};", quote(dependency)));
        }

        for message in &file.message_type {
            self.out.push('\n');
            self.message(message);
        }
        for enumeration in &file.enum_type {
            self.out.push('\n');
            self.enumeration(enumeration);
        }
        if !file.extension.is_empty() {
            self.warnings.push(GenerationWarning::minor(format!(
                "{}: {} extension(s) skipped",
                self.file,
                file.extension.len()
            )));
        }
        for service in file
            .service
            .iter()
            .filter(|s| services.contains(s.name()))
        {
            self.out.push('\n');
            self.service(service);
        }
    }

    fn message(&mut self, message: &DescriptorProto) {
        self.line(format!("message {} {{", message.name()));
        self.indent += 1;

        let map_entries: HashMap<&str, &DescriptorProto> = message
            .nested_type
            .iter()
            .filter(|nested| nested.options.as_ref().is_some_and(|o| o.map_entry()))
            .map(|nested| (nested.name(), nested))
            .collect();

        let mut oneofs: BTreeMap<i32, Vec<&FieldDescriptorProto>> = BTreeMap::new();
        for field in &message.field {
            match field.oneof_index {
                Some(index) if !field.proto3_optional() => {
                    oneofs.entry(index).or_default().push(field);
                }
                _ => self.field(field, &map_entries, true),
            }
        }

        for (index, fields) in oneofs {
            let name = usize::try_from(index)
                .ok()
                .and_then(|i| message.oneof_decl.get(i))
                .map(|decl| decl.name().to_string())
                .unwrap_or_else(|| format!("oneof_{index}"));
            self.line(format!("oneof {name} {{"));
            self.indent += 1;
            for field in fields {
                self.field(field, &map_entries, false);
            }
            self.indent -= 1;
            self.line("}");
        }

        for nested in message
            .nested_type
            .iter()
            .filter(|nested| !map_entries.contains_key(nested.name()))
        {
            self.message(nested);
        }
        for enumeration in &message.enum_type {
            self.enumeration(enumeration);
        }

        for range in &message.extension_range {
            let end = range.end() - 1;
            let end = if end >= MAX_FIELD_NUMBER {
                "max".to_string()
            } else {
                end.to_string()
            };
            self.line(format!("extensions {} to {end};", range.start()));
        }
        if !message.extension.is_empty() {
            self.warnings.push(GenerationWarning::minor(format!(
                "{}: extensions declared in '{}' skipped",
                self.file,
                message.name()
            )));
        }

        for range in &message.reserved_range {
            self.reserved_range(range.start(), range.end() - 1);
        }
        if !message.reserved_name.is_empty() {
            let names: Vec<String> = message.reserved_name.iter().map(|n| quote(n)).collect();
            self.line(format!("reserved {};", names.join(", ")));
        }

        self.indent -= 1;
        self.line("}");
    }

    fn field(
        &mut self,
        field: &FieldDescriptorProto,
        map_entries: &HashMap<&str, &DescriptorProto>,
        allow_label: bool,
    ) {
        if field.r#type() == Type::Group {
            self.warnings.push(GenerationWarning::fatal(format!(
                "{}: group field '{}' cannot be regenerated",
                self.file,
                field.name()
            )));
            return;
        }

        let entry = (field.label() == Label::Repeated && field.r#type() == Type::Message)
            .then(|| {
                let simple = field.type_name().rsplit('.').next().unwrap_or_default();
                map_entries.get(simple).copied()
            })
            .flatten();

        let declaration = match entry {
            Some(entry) => {
                let key = entry.field.iter().find(|f| f.number() == 1);
                let value = entry.field.iter().find(|f| f.number() == 2);
                match (key, value) {
                    (Some(key), Some(value)) => {
                        format!("map<{}, {}>", type_name(key), type_name(value))
                    }
                    _ => {
                        self.warnings.push(GenerationWarning::fatal(format!(
                            "{}: malformed map entry for field '{}'",
                            self.file,
                            field.name()
                        )));
                        return;
                    }
                }
            }
            None => {
                let label = match (allow_label, field.label()) {
                    (false, _) => "",
                    (true, Label::Repeated) => "repeated ",
                    (true, Label::Required) => "required ",
                    (true, Label::Optional) if self.proto2 || field.proto3_optional() => {
                        "optional "
                    }
                    (true, Label::Optional) => "",
                };
                format!("{label}{}", type_name(field))
            }
        };

        let mut options = Vec::new();
        if let Some(default) = &field.default_value {
            options.push(format!("default = {}", default_literal(field, default)));
        }
        if let Some(packed) = field.options.as_ref().and_then(|o| o.packed) {
            options.push(format!("packed = {packed}"));
        }
        if let Some(json_name) = &field.json_name
            && *json_name != default_json_name(field.name())
        {
            options.push(format!("json_name = {}", quote(json_name)));
        }

        let options = if options.is_empty() {
            String::new()
        } else {
            format!(" [{}]", options.join(", "))
        };

        self.line(format!(
            "{declaration} {} = {}{options};",
            field.name(),
            field.number()
        ));
    }

    fn enumeration(&mut self, enumeration: &EnumDescriptorProto) {
        self.line(format!("enum {} {{", enumeration.name()));
        self.indent += 1;

        if enumeration
            .options
            .as_ref()
            .is_some_and(|o| o.allow_alias())
        {
            self.line("option allow_alias = true;");
        }
        for value in &enumeration.value {
            self.line(format!("{} = {};", value.name(), value.number()));
        }
        for range in &enumeration.reserved_range {
            self.reserved_range(range.start(), range.end());
        }
        if !enumeration.reserved_name.is_empty() {
            let names: Vec<String> = enumeration.reserved_name.iter().map(|n| quote(n)).collect();
            self.line(format!("reserved {};", names.join(", ")));
        }

        self.indent -= 1;
        self.line("}");
    }

    /// `end` is inclusive.
    fn reserved_range(&mut self, start: i32, end: i32) {
        if start == end {
            self.line(format!("reserved {start};"));
        } else if end >= MAX_FIELD_NUMBER {
            self.line(format!("reserved {start} to max;"));
        } else {
            self.line(format!("reserved {start} to {end};"));
        }
    }

    fn service(&mut self, service: &ServiceDescriptorProto) {
        self.line(format!("service {} {{", service.name()));
        self.indent += 1;
        for method in &service.method {
            self.method(service.name(), method);
        }
        self.indent -= 1;
        self.line("}");
    }

    fn method(&mut self, service: &str, method: &MethodDescriptorProto) {
        let streaming = method.client_streaming() || method.server_streaming();
        if streaming && !self.options.async_variants {
            self.warnings.push(GenerationWarning::minor(format!(
                "{}: streaming operation '{service}.{}' dropped",
                self.file,
                method.name()
            )));
            return;
        }

        let input_stream = if method.client_streaming() {
            "stream "
        } else {
            ""
        };
        let output_stream = if method.server_streaming() {
            "stream "
        } else {
            ""
        };

        self.line(format!(
            "rpc {}({input_stream}{}) returns ({output_stream}{});",
            method.name(),
            method.input_type(),
            method.output_type()
        ));
    }
}

fn type_name(field: &FieldDescriptorProto) -> String {
    let scalar = match field.r#type() {
        Type::Double => "double",
        Type::Float => "float",
        Type::Int64 => "int64",
        Type::Uint64 => "uint64",
        Type::Int32 => "int32",
        Type::Fixed64 => "fixed64",
        Type::Fixed32 => "fixed32",
        Type::Bool => "bool",
        Type::String => "string",
        Type::Bytes => "bytes",
        Type::Uint32 => "uint32",
        Type::Sfixed32 => "sfixed32",
        Type::Sfixed64 => "sfixed64",
        Type::Sint32 => "sint32",
        Type::Sint64 => "sint64",
        Type::Group | Type::Message | Type::Enum => return field.type_name().to_string(),
    };
    scalar.to_string()
}

fn default_literal(field: &FieldDescriptorProto, value: &str) -> String {
    match field.r#type() {
        Type::String => quote(value),
        // Bytes defaults are stored C-escaped already.
        Type::Bytes => format!("\"{value}\""),
        _ => value.to_string(),
    }
}

fn default_json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\{:03o}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
