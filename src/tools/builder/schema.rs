//! Static extraction of a tool's descriptor from its source.
//!
//! A tool declares `pub struct <tool_name> { ... }`. The struct's doc
//! comment becomes the tool description; each named field becomes one
//! parameter, described by its own doc comment.

use syn::{Attribute, Expr, Fields, GenericArgument, Item, Lit, Meta, PathArguments, Type};

use crate::tools::{ParamType, ToolDescriptor, ToolParameter};

pub fn extract_descriptor(tool_name: &str, source: &str) -> Result<ToolDescriptor, String> {
    let file = syn::parse_file(source).map_err(|e| format!("cannot parse source: {}", e))?;

    let item = file
        .items
        .iter()
        .find_map(|item| match item {
            Item::Struct(s) if s.ident == tool_name => Some(s),
            _ => None,
        })
        .ok_or_else(|| format!("no `struct {}` declared", tool_name))?;

    let parameters = match &item.fields {
        Fields::Named(fields) => fields
            .named
            .iter()
            .filter_map(|field| {
                let ident = field.ident.as_ref()?;
                Some(ToolParameter {
                    name: ident.to_string().trim_start_matches("r#").to_string(),
                    kind: classify(&field.ty),
                    description: doc_text(&field.attrs),
                })
            })
            .collect(),
        Fields::Unnamed(_) | Fields::Unit => Vec::new(),
    };

    Ok(ToolDescriptor {
        name: tool_name.to_string(),
        description: doc_text(&item.attrs),
        parameters,
    })
}

fn doc_text(attrs: &[Attribute]) -> String {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(nv) => match &nv.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(s) => Some(s.value().trim().to_string()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Numeric-looking types become `number`, everything else `string`.
/// `Option<T>`, references and arrays are classified by their element.
fn classify(ty: &Type) -> ParamType {
    match ty {
        Type::Reference(r) => classify(&r.elem),
        Type::Paren(p) => classify(&p.elem),
        Type::Group(g) => classify(&g.elem),
        Type::Path(path) => {
            let Some(segment) = path.path.segments.last() else {
                return ParamType::String;
            };
            let name = segment.ident.to_string();
            if name == "Option" {
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    if let Some(GenericArgument::Type(inner)) = args.args.first() {
                        return classify(inner);
                    }
                }
            }
            if is_numeric(&name) {
                ParamType::Number
            } else {
                ParamType::String
            }
        }
        _ => ParamType::String,
    }
}

fn is_numeric(name: &str) -> bool {
    matches!(
        name,
        "i8" | "i16"
            | "i32"
            | "i64"
            | "i128"
            | "isize"
            | "u8"
            | "u16"
            | "u32"
            | "u64"
            | "u128"
            | "usize"
            | "f32"
            | "f64"
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SOURCE: &str = r#"
use serde::Deserialize;

/// Reads a file from disk.
/// Returns its content.
#[derive(Deserialize)]
#[allow(non_camel_case_types)]
pub struct read_file {
    /// Path relative to the working directory.
    pub path: String,
    /// Maximum bytes to read.
    pub limit: u64,
    /// Scale factor.
    pub scale: Option<f32>,
    pub verbose: bool,
    pub r#type: String,
}

impl read_file {
    pub fn run(&self) -> String {
        String::new()
    }
}
"#;

    #[test]
    fn test_extracts_fields_in_order() {
        let descriptor = extract_descriptor("read_file", SOURCE).unwrap();

        assert_eq!(descriptor.name, "read_file");
        assert_eq!(descriptor.description, "Reads a file from disk.\nReturns its content.");
        let summary: Vec<(&str, ParamType, &str)> = descriptor
            .parameters
            .iter()
            .map(|p| (p.name.as_str(), p.kind, p.description.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("path", ParamType::String, "Path relative to the working directory."),
                ("limit", ParamType::Number, "Maximum bytes to read."),
                ("scale", ParamType::Number, "Scale factor."),
                ("verbose", ParamType::String, ""),
                ("type", ParamType::String, ""),
            ]
        );
    }

    #[test]
    fn test_missing_struct() {
        let err = extract_descriptor("write_file", SOURCE).unwrap_err();
        assert!(err.contains("struct write_file"));
    }

    #[test]
    fn test_unparsable_source() {
        assert!(extract_descriptor("x", "pub struct x {").is_err());
    }
}
